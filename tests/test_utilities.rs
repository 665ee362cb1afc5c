//! A recording in-memory verbs backend shared by the integration tests.
#![allow(dead_code)] // each test binary uses a different subset

use enumflags2::BitFlags;
use rdma_transfer::{
    AccessFlag, CompletionRecord, ConnectionContext, ContextConfig, ContextConfigBuilder,
    DeviceAttr, Gid, MrKeys, PortAttr, Provider, QpCaps, QpTransition, RecvRequest, SendRequest,
    WcOpcode, WcStatus, WorkRequestId,
};
use std::{
    cell::RefCell,
    collections::{HashSet, VecDeque},
    io,
    rc::Rc,
};

/// Name of the only device the mock knows
pub(crate) const MOCK_DEVICE: &str = "mock0";
/// Queue pair number handed out by the mock
pub(crate) const MOCK_QP_NUM: u32 = 0x11;
/// GID of the mock port
pub(crate) const MOCK_GID: [u8; 16] = [0xfe, 0x80, 0, 0, 0, 0, 0, 0, 2, 3, 4, 5, 6, 7, 8, 9];

/// A message arriving from the remote side
#[derive(Debug, Clone, Copy)]
pub(crate) struct Inbound {
    pub(crate) imm: Option<u32>,
    pub(crate) len: u32,
}

#[derive(Debug)]
struct MockState {
    /// Every provider call, in order
    calls: Vec<&'static str>,
    /// Calls that fail instead of succeeding
    fail_on: HashSet<&'static str>,
    /// Handles created and not yet released
    live: usize,
    next_handle: u64,
    transitions: Vec<QpTransition>,
    sends: Vec<SendRequest>,
    recvs: VecDeque<RecvRequest>,
    completions: VecDeque<CompletionRecord>,
    inbound: VecDeque<Inbound>,
    auto_complete_sends: bool,
    /// Complete posted sends one at a time, only once nothing else is pending
    lazy_sends: bool,
    /// Sends posted in lazy mode and not completed yet
    outstanding: VecDeque<SendRequest>,
    /// Payload bytes of every send, copied when it was posted
    payloads: Vec<Vec<u8>>,
    /// Sends posted into a buffer another send still owned
    reused_in_flight: usize,
    device_attr: DeviceAttr,
    caps: Option<QpCaps>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            fail_on: HashSet::new(),
            live: 0,
            next_handle: 1,
            transitions: Vec::new(),
            sends: Vec::new(),
            recvs: VecDeque::new(),
            completions: VecDeque::new(),
            inbound: VecDeque::new(),
            auto_complete_sends: true,
            lazy_sends: false,
            outstanding: VecDeque::new(),
            payloads: Vec::new(),
            reused_in_flight: 0,
            device_attr: DeviceAttr {
                max_cqe: 4096,
                max_srq_wr: 1024,
                max_qp_wr: 1024,
            },
            caps: None,
        }
    }
}

/// Opaque mock handle
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Handle(u64);

/// Clones share one state, so a test keeps a clone to script and inspect the backend
#[derive(Debug, Clone, Default)]
pub(crate) struct MockProvider {
    state: Rc<RefCell<MockState>>,
}

impl MockProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make `op` return an error from now on
    pub(crate) fn fail_on(&self, op: &'static str) {
        let _ = self.state.borrow_mut().fail_on.insert(op);
    }

    /// Keep send completions for [`Self::complete`] instead of generating them
    pub(crate) fn manual_send_completions(&self) {
        self.state.borrow_mut().auto_complete_sends = false;
    }

    /// Hold every send back and complete the oldest one whenever a poll finds nothing else
    pub(crate) fn lazy_send_completions(&self) {
        let mut state = self.state.borrow_mut();
        state.auto_complete_sends = false;
        state.lazy_sends = true;
    }

    /// Sends still waiting for their completion
    pub(crate) fn outstanding_sends(&self) -> usize {
        self.state.borrow().outstanding.len()
    }

    /// Payload bytes of every send, in posting order
    pub(crate) fn payloads(&self) -> Vec<Vec<u8>> {
        self.state.borrow().payloads.clone()
    }

    /// Sends that reused a buffer before its previous send completed
    pub(crate) fn reused_in_flight(&self) -> usize {
        self.state.borrow().reused_in_flight
    }

    pub(crate) fn set_device_attr(&self, attr: DeviceAttr) {
        self.state.borrow_mut().device_attr = attr;
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.state.borrow().calls.clone()
    }

    pub(crate) fn live_handles(&self) -> usize {
        self.state.borrow().live
    }

    pub(crate) fn transitions(&self) -> Vec<QpTransition> {
        self.state.borrow().transitions.clone()
    }

    pub(crate) fn sends(&self) -> Vec<SendRequest> {
        self.state.borrow().sends.clone()
    }

    pub(crate) fn posted_receives(&self) -> usize {
        self.state.borrow().recvs.len()
    }

    pub(crate) fn caps(&self) -> Option<QpCaps> {
        self.state.borrow().caps
    }

    /// Completions generated but not yet polled
    pub(crate) fn pending_completions(&self) -> usize {
        self.state.borrow().completions.len()
    }

    /// Queue a message that is delivered once everything before it was polled
    pub(crate) fn script(&self, imm: Option<u32>, len: u32) {
        self.state
            .borrow_mut()
            .inbound
            .push_back(Inbound { imm, len });
    }

    /// Deliver a message into the oldest posted receive right now
    pub(crate) fn deliver(&self, imm: Option<u32>, len: u32) {
        self.state.borrow_mut().deliver(Inbound { imm, len });
    }

    /// Complete a send with `status`
    pub(crate) fn complete(&self, wr_id: impl Into<WorkRequestId>, status: WcStatus) {
        self.state
            .borrow_mut()
            .completions
            .push_back(CompletionRecord {
                status,
                opcode: WcOpcode::Send,
                wr_id: wr_id.into(),
                byte_len: 0,
                imm: None,
            });
    }

    /// Append an arbitrary completion
    pub(crate) fn push_completion(&self, record: CompletionRecord) {
        self.state.borrow_mut().completions.push_back(record);
    }
}

impl MockState {
    fn call(&mut self, op: &'static str) -> io::Result<()> {
        self.calls.push(op);
        if self.fail_on.contains(op) {
            Err(io::Error::new(io::ErrorKind::Other, format!("mock {op} failed")))
        } else {
            Ok(())
        }
    }

    fn create(&mut self, op: &'static str) -> io::Result<Handle> {
        self.call(op)?;
        self.live += 1;
        self.next_handle += 1;
        Ok(Handle(self.next_handle))
    }

    fn release(&mut self, op: &'static str) -> io::Result<()> {
        self.call(op)?;
        self.live -= 1;
        Ok(())
    }

    fn deliver(&mut self, inbound: Inbound) {
        let recv = self
            .recvs
            .pop_front()
            .expect("message delivered without a posted receive");
        assert!(inbound.len <= recv.sge.length, "message larger than the receive");
        self.completions.push_back(CompletionRecord {
            status: WcStatus::Success,
            opcode: WcOpcode::Recv,
            wr_id: recv.wr_id,
            byte_len: inbound.len,
            imm: inbound.imm,
        });
    }
}

impl Provider for MockProvider {
    type Device = Handle;
    type Pd = Handle;
    type Mr = Handle;
    type Cq = Handle;
    type Srq = Handle;
    type Qp = Handle;

    fn open_device(&mut self, name: &str) -> io::Result<Handle> {
        if name != MOCK_DEVICE {
            self.state.borrow_mut().calls.push("open_device");
            return Err(io::Error::new(io::ErrorKind::NotFound, name.to_owned()));
        }
        self.state.borrow_mut().create("open_device")
    }

    fn close_device(&mut self, _: Handle) -> io::Result<()> {
        self.state.borrow_mut().release("close_device")
    }

    fn alloc_pd(&mut self, _: &Handle) -> io::Result<Handle> {
        self.state.borrow_mut().create("alloc_pd")
    }

    fn dealloc_pd(&mut self, _: Handle) -> io::Result<()> {
        self.state.borrow_mut().release("dealloc_pd")
    }

    fn query_port(&mut self, _: &Handle, _: u8) -> io::Result<PortAttr> {
        self.state.borrow_mut().call("query_port")?;
        Ok(PortAttr {
            lid: 0,
            state: 4,
            active_mtu: 5,
        })
    }

    fn query_gid(&mut self, _: &Handle, _: u8, _: u8) -> io::Result<Gid> {
        self.state.borrow_mut().call("query_gid")?;
        Ok(Gid::from_raw(MOCK_GID))
    }

    fn query_device(&mut self, _: &Handle) -> io::Result<DeviceAttr> {
        let mut state = self.state.borrow_mut();
        state.call("query_device")?;
        Ok(state.device_attr)
    }

    fn reg_mr(
        &mut self,
        _: &Handle,
        buf: &mut [u8],
        _: BitFlags<AccessFlag>,
    ) -> io::Result<(Handle, MrKeys)> {
        let mr = self.state.borrow_mut().create("reg_mr")?;
        let keys = MrKeys {
            addr: buf.as_ptr() as u64,
            lkey: 0x1000,
            rkey: 0x2000,
        };
        Ok((mr, keys))
    }

    fn dereg_mr(&mut self, _: Handle) -> io::Result<()> {
        self.state.borrow_mut().release("dereg_mr")
    }

    fn create_cq(&mut self, _: &Handle, _: u32) -> io::Result<Handle> {
        self.state.borrow_mut().create("create_cq")
    }

    fn destroy_cq(&mut self, _: Handle) -> io::Result<()> {
        self.state.borrow_mut().release("destroy_cq")
    }

    fn create_srq(&mut self, _: &Handle, _: u32) -> io::Result<Handle> {
        self.state.borrow_mut().create("create_srq")
    }

    fn destroy_srq(&mut self, _: Handle) -> io::Result<()> {
        self.state.borrow_mut().release("destroy_srq")
    }

    fn create_qp(
        &mut self,
        _: &Handle,
        _: &Handle,
        _: &Handle,
        caps: QpCaps,
    ) -> io::Result<(Handle, u32)> {
        let mut state = self.state.borrow_mut();
        let qp = state.create("create_qp")?;
        state.caps = Some(caps);
        Ok((qp, MOCK_QP_NUM))
    }

    fn destroy_qp(&mut self, _: Handle) -> io::Result<()> {
        self.state.borrow_mut().release("destroy_qp")
    }

    fn modify_qp(&mut self, _: &Handle, transition: &QpTransition) -> io::Result<()> {
        let op = match *transition {
            QpTransition::ToInit(_) => "modify_to_init",
            QpTransition::ToRtr(_) => "modify_to_rtr",
            QpTransition::ToRts(_) => "modify_to_rts",
        };
        let mut state = self.state.borrow_mut();
        state.call(op)?;
        state.transitions.push(*transition);
        Ok(())
    }

    fn post_send(&mut self, _: &Handle, wr: &SendRequest) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.call("post_send")?;
        state.sends.push(*wr);
        if let Some(sge) = wr.sge {
            let busy = state
                .outstanding
                .iter()
                .filter_map(|sent| sent.sge)
                .any(|sent| sent.addr == sge.addr);
            if busy {
                state.reused_in_flight += 1;
            }
            // SAFETY: the engine only posts ranges of its registered buffer, alive during the call
            let bytes = unsafe {
                std::slice::from_raw_parts(sge.addr as *const u8, sge.length as usize)
            };
            state.payloads.push(bytes.to_vec());
        }
        if state.lazy_sends {
            state.outstanding.push_back(*wr);
        } else if state.auto_complete_sends {
            state.completions.push_back(CompletionRecord {
                status: WcStatus::Success,
                opcode: WcOpcode::Send,
                wr_id: wr.wr_id,
                byte_len: 0,
                imm: None,
            });
        }
        Ok(())
    }

    fn post_srq_recv(&mut self, _: &Handle, wr: &RecvRequest) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.call("post_srq_recv")?;
        state.recvs.push_back(*wr);
        Ok(())
    }

    /// Errors once nothing is left to hand out, so a stuck loop fails instead of spinning
    fn poll_cq(
        &mut self,
        _: &Handle,
        max: usize,
        out: &mut Vec<CompletionRecord>,
    ) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.completions.is_empty() {
            if let Some(inbound) = state.inbound.pop_front() {
                state.deliver(inbound);
            }
        }
        if state.completions.is_empty() {
            if let Some(sent) = state.outstanding.pop_front() {
                state.completions.push_back(CompletionRecord {
                    status: WcStatus::Success,
                    opcode: WcOpcode::Send,
                    wr_id: sent.wr_id,
                    byte_len: 0,
                    imm: None,
                });
            }
        }
        if state.completions.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "mock completion queue drained",
            ));
        }
        let take = max.min(state.completions.len());
        out.extend(state.completions.drain(..take));
        Ok(take)
    }
}

/// Context settings for the mock device
pub(crate) fn mock_config(mr_size: usize) -> ContextConfig {
    ContextConfigBuilder::default()
        .device_name(MOCK_DEVICE)
        .mr_size(mr_size)
        .build()
        .unwrap()
}

/// The remote side as the mock would see it
pub(crate) fn remote_parameters() -> rdma_transfer::ConnectionParameters {
    rdma_transfer::ConnectionParameters::new(0x22, 0, Gid::from_raw([0xab; 16]))
}

/// A context already walked to RTS
pub(crate) fn connected_context(
    mock: &MockProvider,
    mr_size: usize,
) -> ConnectionContext<MockProvider> {
    let mut ctx = ConnectionContext::open(mock.clone(), &mock_config(mr_size)).unwrap();
    ctx.connect(&remote_parameters()).unwrap();
    ctx
}
