use crate::message::WorkRequestId;

/// A scatter/gather entry inside the registered region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    /// Virtual address of the first byte
    pub addr: u64,
    /// Length in bytes
    pub length: u32,
    /// Local key of the region the bytes belong to
    pub lkey: u32,
}

/// A signaled SEND, optionally with immediate data
///
/// Control signals carry no payload, so `sge` may be empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRequest {
    /// Correlation tag returned on the completion
    pub wr_id: WorkRequestId,
    /// Payload, at most one entry
    pub sge: Option<Sge>,
    /// Immediate data in host order
    pub imm: Option<u32>,
}

impl SendRequest {
    /// A send carrying only immediate data
    #[inline]
    #[must_use]
    pub fn signal(wr_id: WorkRequestId, imm: u32) -> Self {
        Self {
            wr_id,
            sge: None,
            imm: Some(imm),
        }
    }

    /// A send of `sge` tagged with `imm`
    #[inline]
    #[must_use]
    pub fn with_payload(wr_id: WorkRequestId, sge: Sge, imm: u32) -> Self {
        Self {
            wr_id,
            sge: Some(sge),
            imm: Some(imm),
        }
    }
}

/// A receive buffer posted to the shared receive queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvRequest {
    /// Correlation tag returned on the completion
    pub wr_id: WorkRequestId,
    /// Landing buffer
    pub sge: Sge,
}
