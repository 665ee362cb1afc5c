use std::{fmt, io, ops::Range};

use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use tracing::{debug, error, info};

use crate::{
    access::mr_access,
    completion::CompletionRecord,
    error::{Error, Resource, Result, TeardownFailure, Transition},
    gid::Gid,
    provider::{DeviceAttr, MrKeys, PortAttr, Provider},
    queue_pair::{
        ConnectionParameters, InitAttrBuilder, QpCaps, QpTransition, QueuePairState, RQAttr,
        SQAttrBuilder, DEFAULT_GID_INDEX, DEFAULT_PORT_NUM,
    },
    work_request::{RecvRequest, SendRequest, Sge},
};

/// What to open and how large to make it
#[derive(Debug, Clone, Getters, CopyGetters, Builder)]
#[builder(derive(Debug))]
pub struct ContextConfig {
    /// Exact kernel name of the device
    #[builder(setter(into))]
    #[getset(get = "pub")]
    device_name: String,
    /// Bytes of the registered transfer buffer
    #[getset(get_copy = "pub")]
    mr_size: usize,
    /// Local port
    #[builder(default = "DEFAULT_PORT_NUM")]
    #[getset(get_copy = "pub")]
    ib_port: u8,
    /// Index of the local GID
    #[builder(default = "DEFAULT_GID_INDEX")]
    #[getset(get_copy = "pub")]
    gid_index: u8,
    /// Completion queue depth, the device maximum when unset
    #[builder(default)]
    #[getset(get_copy = "pub")]
    cq_depth: Option<u32>,
    /// Shared receive queue depth, the device maximum when unset
    #[builder(default)]
    #[getset(get_copy = "pub")]
    srq_depth: Option<u32>,
    /// Queue pair depth, the device maximum when unset
    #[builder(default)]
    #[getset(get_copy = "pub")]
    qp_depth: Option<u32>,
}

/// Requested depth bounded by what the device supports
fn clamp_depth(requested: Option<u32>, device_max: u32) -> u32 {
    requested.map_or(device_max, |depth| depth.min(device_max))
}

/// Error for a handle that teardown already took
fn released(resource: Resource) -> Error {
    Error::Protocol(format!("{resource} was already released"))
}

/// Every hardware resource of one connection.
///
/// [`ConnectionContext::open`] creates them in order and [`ConnectionContext::close`] (or drop)
/// releases them in exact reverse order. A failed `open` releases whatever it had created
/// through the same path.
pub struct ConnectionContext<P: Provider> {
    /// Verbs backend
    provider: P,
    /// Opened device
    device: Option<P::Device>,
    /// Protection domain
    pd: Option<P::Pd>,
    /// Registration of `buf`
    mr: Option<P::Mr>,
    /// Completion queue, shared by send and receive
    cq: Option<P::Cq>,
    /// Shared receive queue
    srq: Option<P::Srq>,
    /// The queue pair
    qp: Option<P::Qp>,
    /// Registered transfer buffer, never moved while `mr` is alive
    buf: Box<[u8]>,
    /// Keys of `mr`
    keys: Option<MrKeys>,
    /// Port attributes
    port_attr: PortAttr,
    /// Device capabilities
    device_attr: DeviceAttr,
    /// Local GID
    gid: Gid,
    /// Local queue pair number
    qp_num: u32,
    /// Local port used for INIT and RTR
    port_num: u8,
    /// Local GID index used for RTR
    gid_index: u8,
    /// Last state the queue pair was moved to
    state: QueuePairState,
}

impl<P: Provider> ConnectionContext<P> {
    /// Open the device and create every resource, strictly in order
    #[inline]
    pub fn open(provider: P, config: &ContextConfig) -> Result<Self> {
        let mut ctx = Self {
            provider,
            device: None,
            pd: None,
            mr: None,
            cq: None,
            srq: None,
            qp: None,
            buf: Box::default(),
            keys: None,
            port_attr: PortAttr::default(),
            device_attr: DeviceAttr::default(),
            gid: Gid::default(),
            qp_num: 0,
            port_num: config.ib_port(),
            gid_index: config.gid_index(),
            state: QueuePairState::Reset,
        };
        // on error `ctx` drops here and tears down what exists
        ctx.setup(config)?;
        info!(
            "opened {}: lid {}, gid {}, qp {}",
            config.device_name(),
            ctx.port_attr.lid,
            ctx.gid,
            ctx.qp_num
        );
        Ok(ctx)
    }

    /// The ordered creation sequence
    fn setup(&mut self, config: &ContextConfig) -> Result<()> {
        let name = config.device_name();
        let device = self.provider.open_device(name).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                Error::DeviceNotFound(name.clone())
            } else {
                Error::Device {
                    step: "open",
                    source,
                }
            }
        })?;
        let device = &*self.device.insert(device);

        let pd = self
            .provider
            .alloc_pd(device)
            .map_err(|source| Error::ResourceSetup {
                resource: Resource::ProtectionDomain,
                source,
            })?;
        let pd = &*self.pd.insert(pd);

        self.port_attr = self
            .provider
            .query_port(device, self.port_num)
            .map_err(|source| Error::Device {
                step: "query port",
                source,
            })?;
        self.gid = self
            .provider
            .query_gid(device, self.port_num, self.gid_index)
            .map_err(|source| Error::Device {
                step: "query gid",
                source,
            })?;

        self.buf = vec![0_u8; config.mr_size()].into_boxed_slice();
        let (mr, keys) = self
            .provider
            .reg_mr(pd, &mut self.buf, mr_access())
            .map_err(|source| Error::ResourceSetup {
                resource: Resource::MemoryRegion,
                source,
            })?;
        self.mr = Some(mr);
        self.keys = Some(keys);

        self.device_attr = self
            .provider
            .query_device(device)
            .map_err(|source| Error::Device {
                step: "query device",
                source,
            })?;
        debug!("device capabilities {:?}", self.device_attr);

        let cq_depth = clamp_depth(config.cq_depth(), self.device_attr.max_cqe);
        let cq = self
            .provider
            .create_cq(device, cq_depth)
            .map_err(|source| Error::ResourceSetup {
                resource: Resource::CompletionQueue,
                source,
            })?;
        let cq = &*self.cq.insert(cq);

        let srq_depth = clamp_depth(config.srq_depth(), self.device_attr.max_srq_wr);
        let srq = self
            .provider
            .create_srq(pd, srq_depth)
            .map_err(|source| Error::ResourceSetup {
                resource: Resource::SharedReceiveQueue,
                source,
            })?;
        let srq = &*self.srq.insert(srq);

        let qp_depth = clamp_depth(config.qp_depth(), self.device_attr.max_qp_wr);
        let (qp, qp_num) = self
            .provider
            .create_qp(pd, cq, srq, QpCaps::single_sge(qp_depth))
            .map_err(|source| Error::ResourceSetup {
                resource: Resource::QueuePair,
                source,
            })?;
        self.qp = Some(qp);
        self.qp_num = qp_num;
        self.state = QueuePairState::Reset;
        Ok(())
    }

    /// Release everything that exists, newest first, continuing past failures
    fn teardown(&mut self) -> Vec<TeardownFailure> {
        let mut failures = Vec::new();
        if let Some(qp) = self.qp.take() {
            let ret = self.provider.destroy_qp(qp);
            note_release(&mut failures, Resource::QueuePair, ret);
        }
        if let Some(srq) = self.srq.take() {
            let ret = self.provider.destroy_srq(srq);
            note_release(&mut failures, Resource::SharedReceiveQueue, ret);
        }
        if let Some(cq) = self.cq.take() {
            let ret = self.provider.destroy_cq(cq);
            note_release(&mut failures, Resource::CompletionQueue, ret);
        }
        if let Some(mr) = self.mr.take() {
            self.keys = None;
            let ret = self.provider.dereg_mr(mr);
            note_release(&mut failures, Resource::MemoryRegion, ret);
        }
        if let Some(pd) = self.pd.take() {
            let ret = self.provider.dealloc_pd(pd);
            note_release(&mut failures, Resource::ProtectionDomain, ret);
        }
        if let Some(device) = self.device.take() {
            let ret = self.provider.close_device(device);
            note_release(&mut failures, Resource::Device, ret);
        }
        failures
    }

    /// Release every resource in reverse creation order.
    ///
    /// All steps are attempted. Failures are logged and returned together.
    #[inline]
    pub fn close(mut self) -> Result<()> {
        let failures = self.teardown();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(failures))
        }
    }

    /// The parameters the remote side needs to reach this queue pair
    #[inline]
    #[must_use]
    pub fn local_parameters(&self) -> ConnectionParameters {
        ConnectionParameters::new(self.qp_num, self.port_attr.lid, self.gid)
    }

    /// Apply one transition after checking it starts from the current state
    fn apply(&mut self, transition: QpTransition) -> Result<()> {
        let name = transition.transition();
        if self.state != QueuePairState::source_of(name) {
            return Err(Error::TransitionRejected {
                transition: name,
                reason: "queue pair is not in the source state",
            });
        }
        let qp = self.qp.as_ref().ok_or(Error::TransitionRejected {
            transition: name,
            reason: "queue pair was released",
        })?;
        self.provider
            .modify_qp(qp, &transition)
            .map_err(|source| Error::QpTransition {
                transition: name,
                source,
            })?;
        self.state = QueuePairState::target_of(name);
        debug!("queue pair {} {}", self.qp_num, name);
        Ok(())
    }

    /// RESET -> INIT
    #[inline]
    pub fn modify_to_init(&mut self) -> Result<()> {
        let attr = InitAttrBuilder::default()
            .port_num(self.port_num)
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        self.apply(QpTransition::ToInit(attr))
    }

    /// INIT -> RTR, rejected until the remote parameters are complete
    #[inline]
    pub fn modify_to_rtr(&mut self, remote: &ConnectionParameters) -> Result<()> {
        if let Some(reason) = remote.missing() {
            return Err(Error::TransitionRejected {
                transition: Transition::InitToRtr,
                reason,
            });
        }
        let attr = RQAttr::for_remote(remote, self.port_num, self.gid_index);
        self.apply(QpTransition::ToRtr(attr))
    }

    /// RTR -> RTS
    #[inline]
    pub fn modify_to_rts(&mut self) -> Result<()> {
        let attr = SQAttrBuilder::default()
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        self.apply(QpTransition::ToRts(attr))
    }

    /// Walk the queue pair from RESET to RTS towards `remote`
    #[inline]
    pub fn connect(&mut self, remote: &ConnectionParameters) -> Result<()> {
        self.modify_to_init()?;
        self.modify_to_rtr(remote)?;
        self.modify_to_rts()?;
        info!(
            "queue pair {} connected to qp {} lid {} gid {}",
            self.qp_num,
            remote.qp_num(),
            remote.lid(),
            remote.gid()
        );
        Ok(())
    }

    /// Current queue pair state
    #[inline]
    #[must_use]
    pub fn state(&self) -> QueuePairState {
        self.state
    }

    /// Queried port attributes
    #[inline]
    #[must_use]
    pub fn port_attr(&self) -> PortAttr {
        self.port_attr
    }

    /// Queried device capabilities
    #[inline]
    #[must_use]
    pub fn device_attr(&self) -> DeviceAttr {
        self.device_attr
    }

    /// The verbs backend
    #[inline]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Length of the registered buffer
    #[inline]
    #[must_use]
    pub fn mr_len(&self) -> usize {
        self.buf.len()
    }

    /// Bytes of the registered buffer
    pub(crate) fn buffer(&self, range: Range<usize>) -> &[u8] {
        self.buf.get(range).unwrap_or_default()
    }

    /// Mutable bytes of the registered buffer
    pub(crate) fn buffer_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        self.buf.get_mut(range).unwrap_or_default()
    }

    /// Scatter/gather entry covering `range` of the registered buffer
    pub(crate) fn sge(&self, range: Range<usize>) -> Result<Sge> {
        let keys = self.keys.ok_or_else(|| released(Resource::MemoryRegion))?;
        let too_large = || Error::Protocol(format!("buffer range {range:?} out of bounds"));
        if range.end > self.buf.len() {
            return Err(too_large());
        }
        let offset = u64::try_from(range.start).map_err(|_| too_large())?;
        let length = u32::try_from(range.len()).map_err(|_| too_large())?;
        Ok(Sge {
            addr: keys.addr.saturating_add(offset),
            length,
            lkey: keys.lkey,
        })
    }

    /// Post a send on the queue pair
    pub(crate) fn post_send(&mut self, wr: &SendRequest) -> Result<()> {
        let qp = self.qp.as_ref().ok_or_else(|| released(Resource::QueuePair))?;
        self.provider
            .post_send(qp, wr)
            .map_err(|source| Error::Post {
                what: "send",
                source,
            })
    }

    /// Post a receive on the shared receive queue
    pub(crate) fn post_recv(&mut self, wr: &RecvRequest) -> Result<()> {
        let srq = self
            .srq
            .as_ref()
            .ok_or_else(|| released(Resource::SharedReceiveQueue))?;
        self.provider
            .post_srq_recv(srq, wr)
            .map_err(|source| Error::Post {
                what: "receive",
                source,
            })
    }

    /// Poll up to `max` completions into `out`
    pub(crate) fn poll(&mut self, max: usize, out: &mut Vec<CompletionRecord>) -> Result<usize> {
        let cq = self
            .cq
            .as_ref()
            .ok_or_else(|| released(Resource::CompletionQueue))?;
        self.provider.poll_cq(cq, max, out).map_err(Error::Poll)
    }
}

/// Log and collect one teardown step
fn note_release(failures: &mut Vec<TeardownFailure>, resource: Resource, ret: io::Result<()>) {
    match ret {
        Ok(()) => debug!("released {}", resource),
        Err(source) => {
            error!("failed to release {}: {}", resource, source);
            failures.push(TeardownFailure { resource, source });
        }
    }
}

impl<P: Provider> Drop for ConnectionContext<P> {
    #[inline]
    fn drop(&mut self) {
        // failures were logged by `note_release`
        let _failures = self.teardown();
    }
}

impl<P: Provider> fmt::Debug for ConnectionContext<P> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("qp_num", &self.qp_num)
            .field("lid", &self.port_attr.lid)
            .field("gid", &self.gid)
            .field("state", &self.state)
            .field("mr_len", &self.buf.len())
            .finish()
    }
}
