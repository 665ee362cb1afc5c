//! The verbs capability interface.
//!
//! The connection context and the transfer engine only ever talk to the hardware through
//! [`Provider`]. [`crate::IbvProvider`] drives libibverbs; tests substitute a recording mock.

use std::io;

use enumflags2::BitFlags;

use crate::{
    access::AccessFlag,
    completion::CompletionRecord,
    gid::Gid,
    queue_pair::{QpCaps, QpTransition},
    work_request::{RecvRequest, SendRequest},
};

/// Port attributes the transport needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortAttr {
    /// Base LID, zero on RoCE ports
    pub lid: u16,
    /// Raw `ibv_port_state`
    pub state: u32,
    /// Raw active `ibv_mtu`
    pub active_mtu: u32,
}

/// Device capabilities bounding queue depths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceAttr {
    /// Maximum completion queue entries
    pub max_cqe: u32,
    /// Maximum outstanding work requests on a shared receive queue
    pub max_srq_wr: u32,
    /// Maximum outstanding work requests on a queue pair
    pub max_qp_wr: u32,
}

/// Keys and placement of a registered region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrKeys {
    /// Address of the first registered byte
    pub addr: u64,
    /// Local key, used in scatter/gather entries
    pub lkey: u32,
    /// Remote key
    pub rkey: u32,
}

/// Hardware capabilities consumed by the transport.
///
/// Handles are owned values. Every `destroy_*`, `dealloc_pd`, `dereg_mr` and `close_device`
/// consumes its handle, so a handle can be released at most once.
pub trait Provider {
    /// An opened device context
    type Device;
    /// Protection domain
    type Pd;
    /// Registered memory region
    type Mr;
    /// Completion queue
    type Cq;
    /// Shared receive queue
    type Srq;
    /// Queue pair
    type Qp;

    /// Open the device named exactly `name`, `io::ErrorKind::NotFound` if there is none
    fn open_device(&mut self, name: &str) -> io::Result<Self::Device>;
    /// Close a device context
    fn close_device(&mut self, device: Self::Device) -> io::Result<()>;
    /// Allocate a protection domain
    fn alloc_pd(&mut self, device: &Self::Device) -> io::Result<Self::Pd>;
    /// Free a protection domain
    fn dealloc_pd(&mut self, pd: Self::Pd) -> io::Result<()>;
    /// Query a port
    fn query_port(&mut self, device: &Self::Device, port_num: u8) -> io::Result<PortAttr>;
    /// Query one entry of a port's GID table
    fn query_gid(&mut self, device: &Self::Device, port_num: u8, index: u8) -> io::Result<Gid>;
    /// Query device capabilities
    fn query_device(&mut self, device: &Self::Device) -> io::Result<DeviceAttr>;
    /// Pin and register `buf`. The caller keeps `buf` alive and in place until `dereg_mr`.
    fn reg_mr(
        &mut self,
        pd: &Self::Pd,
        buf: &mut [u8],
        access: BitFlags<AccessFlag>,
    ) -> io::Result<(Self::Mr, MrKeys)>;
    /// Deregister a region
    fn dereg_mr(&mut self, mr: Self::Mr) -> io::Result<()>;
    /// Create a completion queue holding `depth` entries
    fn create_cq(&mut self, device: &Self::Device, depth: u32) -> io::Result<Self::Cq>;
    /// Destroy a completion queue
    fn destroy_cq(&mut self, cq: Self::Cq) -> io::Result<()>;
    /// Create a shared receive queue holding `depth` requests
    fn create_srq(&mut self, pd: &Self::Pd, depth: u32) -> io::Result<Self::Srq>;
    /// Destroy a shared receive queue
    fn destroy_srq(&mut self, srq: Self::Srq) -> io::Result<()>;
    /// Create a reliable-connection queue pair in RESET, returning it with its number
    fn create_qp(
        &mut self,
        pd: &Self::Pd,
        cq: &Self::Cq,
        srq: &Self::Srq,
        caps: QpCaps,
    ) -> io::Result<(Self::Qp, u32)>;
    /// Destroy a queue pair
    fn destroy_qp(&mut self, qp: Self::Qp) -> io::Result<()>;
    /// Apply one state transition
    fn modify_qp(&mut self, qp: &Self::Qp, transition: &QpTransition) -> io::Result<()>;
    /// Post a signaled send
    fn post_send(&mut self, qp: &Self::Qp, wr: &SendRequest) -> io::Result<()>;
    /// Post a receive buffer to the shared receive queue
    fn post_srq_recv(&mut self, srq: &Self::Srq, wr: &RecvRequest) -> io::Result<()>;
    /// Append up to `max` completions to `out`, returning how many were appended.
    ///
    /// Returns `Ok(0)` when nothing has completed yet.
    fn poll_cq(
        &mut self,
        cq: &Self::Cq,
        max: usize,
        out: &mut Vec<CompletionRecord>,
    ) -> io::Result<usize>;
}
