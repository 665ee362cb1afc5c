use enumflags2::{bitflags, BitFlags};
use rdma_sys::ibv_access_flags;

/// A wrapper for `ibv_access_flag`, hide the ibv binding types
#[bitflags]
#[repr(u64)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessFlag {
    /// local write permission
    LocalWrite,
    /// remote write permission
    RemoteWrite,
    /// remote read permission
    RemoteRead,
    /// remote atomic operation permission
    RemoteAtomic,
}

/// Access granted to the registered transfer buffer
#[inline]
#[must_use]
pub fn mr_access() -> BitFlags<AccessFlag> {
    AccessFlag::LocalWrite | AccessFlag::RemoteWrite | AccessFlag::RemoteRead
}

/// Access granted to the queue pair when it enters INIT
#[inline]
#[must_use]
pub fn qp_access() -> BitFlags<AccessFlag> {
    mr_access() | AccessFlag::RemoteAtomic
}

/// Convert `BitFlags<AccessFlag>` into `ibv_access_flags`
#[inline]
#[must_use]
pub(crate) fn flags_into_ibv_access(flags: BitFlags<AccessFlag>) -> ibv_access_flags {
    let mut ret = ibv_access_flags(0);
    if flags.contains(AccessFlag::LocalWrite) {
        ret |= ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
    }
    if flags.contains(AccessFlag::RemoteWrite) {
        ret |= ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
    }
    if flags.contains(AccessFlag::RemoteRead) {
        ret |= ibv_access_flags::IBV_ACCESS_REMOTE_READ;
    }
    if flags.contains(AccessFlag::RemoteAtomic) {
        ret |= ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC;
    }
    ret
}
