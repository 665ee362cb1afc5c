use std::fmt;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use thiserror::Error;

use crate::message::WorkRequestId;

/// Opcode of a work completion, as far as this transport cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    /// A posted send finished
    Send,
    /// A posted receive consumed an incoming message
    Recv,
    /// Anything else the provider reports
    Other(u32),
}

impl fmt::Display for WcOpcode {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Send => f.write_str("SEND"),
            Self::Recv => f.write_str("RECEIVE"),
            Self::Other(raw) => write!(f, "unknown opcode {raw}"),
        }
    }
}

/// Status of a work completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    /// `IBV_WC_SUCCESS`
    Success,
    /// Any other status
    Failed(WCError),
}

impl WcStatus {
    /// Map a raw `ibv_wc_status` value, zero being success
    #[inline]
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        if raw == 0 {
            Self::Success
        } else {
            Self::Failed(WCError::from_u32(raw).unwrap_or(WCError::UnexpectedErr))
        }
    }
}

/// One polled completion. Consumed and dropped by the engine, never stored past its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionRecord {
    /// Completion status
    pub status: WcStatus,
    /// Completion opcode
    pub opcode: WcOpcode,
    /// The tag of the request that produced this completion
    pub wr_id: WorkRequestId,
    /// Bytes received, only meaningful for receives
    pub byte_len: u32,
    /// Immediate data in host order, if the message carried any
    pub imm: Option<u32>,
}

impl CompletionRecord {
    /// Whether the completion succeeded
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == WcStatus::Success
    }

    /// Returns the completion error if this record failed
    #[inline]
    pub fn check(&self) -> Result<(), CompletionError> {
        match self.status {
            WcStatus::Success => Ok(()),
            WcStatus::Failed(status) => Err(CompletionError {
                opcode: self.opcode,
                wr_id: self.wr_id,
                status,
            }),
        }
    }
}

/// A completion came back with a non-success status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{opcode} completion for wr_id {wr_id} failed: {status}")]
pub struct CompletionError {
    /// Opcode of the failed completion
    pub opcode: WcOpcode,
    /// Tag of the failed request
    pub wr_id: WorkRequestId,
    /// Reported status
    pub status: WCError,
}

impl CompletionError {
    /// Failures whose opcode this transport never posts
    #[inline]
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        matches!(self.opcode, WcOpcode::Other(_))
    }
}

/// Wrapper for work completion error
#[allow(clippy::missing_docs_in_private_items, missing_docs)]
#[derive(Error, Debug, FromPrimitive, Copy, Clone, PartialEq, Eq)]
pub enum WCError {
    #[error("Local Length Error: this happens if a Work Request that was posted in a local Send Queue contains a message that is greater than the maximum message size that is supported by the RDMA device port that should send the message. This also may happen if a Work Request that was posted in a local Receive Queue isn't big enough for holding the incoming message.")]
    LocLenErr = 1,
    #[error("Local QP Operation Error: an internal QP consistency error was detected while processing this Work Request.")]
    LocQpOpErr = 2,
    #[error("Local EE Context Operation Error: an internal EE Context consistency error was detected while processing this Work Request.")]
    LocEecOpErr = 3,
    #[error("Local Protection Error: the locally posted Work Request's buffers in the scatter/gather list does not reference a Memory Region that is valid for the requested operation.")]
    LocProtErr = 4,
    #[error("Work Request Flushed Error: A Work Request was in process or outstanding when the QP transitioned into the Error State.")]
    WrFlushErr = 5,
    #[error("Memory Window Binding Error: A failure happened when tried to bind a MW to a MR.")]
    MwBindErr = 6,
    #[error("Bad Response Error: an unexpected transport layer opcode was returned by the responder.")]
    BadRespErr = 7,
    #[error("Local Access Error: a protection error occurred on a local data buffer during the processing of an operation sent from the remote node.")]
    LocAccessErr = 8,
    #[error("Remote Invalid Request Error: The responder detected an invalid message on the channel, for example insufficient buffering to receive a new message.")]
    RemInvReqErr = 9,
    #[error("Remote Access Error: a protection error occurred on a remote data buffer.")]
    RemAccessErr = 10,
    #[error("Remote Operation Error: the operation could not be completed successfully by the responder.")]
    RemOpErr = 11,
    #[error("Transport Retry Counter Exceeded: the remote side didn't send any Ack or Nack. On the first message this usually means the connection attributes are wrong; later it usually means the remote QP isn't available anymore.")]
    RetryExc = 12,
    #[error("RNR Retry Counter Exceeded: The RNR NAK retry count was exceeded. This usually means that the remote side didn't post any WR to its Receive Queue.")]
    RnrRetryExc = 13,
    #[error("Local RDD Violation Error: The RDD associated with the QP does not match the RDD associated with the EE Context.")]
    LocRddViolErr = 14,
    #[error("Remote Invalid RD Request: The responder detected an invalid incoming RD message.")]
    RemInvRdReq = 15,
    #[error("Remote Aborted Error: For UD or UC QPs associated with a SRQ, the responder aborted the operation.")]
    RemAbortErr = 16,
    #[error("Invalid EE Context Number: An invalid EE Context number was detected.")]
    InvEecn = 17,
    #[error("Invalid EE Context State Error: Operation is not legal for the specified EE Context state.")]
    InvEecState = 18,
    #[error("Fatal Error.")]
    Fatal = 19,
    #[error("Response Timeout Error.")]
    RespTimeout = 20,
    #[error("General Error: other error which isn't one of the above errors.")]
    GeneralErr = 21,
    #[error("Unexpected Error.")]
    UnexpectedErr = 100,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_status_mapping() {
        assert_eq!(WcStatus::from_raw(0), WcStatus::Success);
        assert_eq!(WcStatus::from_raw(13), WcStatus::Failed(WCError::RnrRetryExc));
        assert_eq!(WcStatus::from_raw(77), WcStatus::Failed(WCError::UnexpectedErr));
    }

    #[test]
    fn failed_record_names_opcode() {
        let record = CompletionRecord {
            status: WcStatus::Failed(WCError::WrFlushErr),
            opcode: WcOpcode::Other(9),
            wr_id: WorkRequestId::from(3_u64),
            byte_len: 0,
            imm: None,
        };
        let err = record.check().unwrap_err();
        assert!(err.is_unknown());
        assert!(err.to_string().starts_with("unknown opcode 9 completion"));
    }
}
