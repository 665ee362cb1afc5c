//! Tags carried in the 32-bit immediate data and the 64-bit work request id.

use std::fmt;

use crate::error::{Error, Result};

/// Rendezvous signal sent by the responder to every peer
pub const MSG_CLIENT_START: u32 = 100;
/// Termination signal sent by the responder once it has what it waited for
pub const MSG_CLIENT_STOP: u32 = 101;
/// Sentinel marking the sends of the termination barrier
pub const IB_WR_ID_STOP: u64 = 0xE000_0000_0000_0000;
/// Marks the sends of the rendezvous signal
pub const IB_WR_ID_START: u64 = 0xD000_0000_0000_0000;

/// High nibble of a wr id selects its kind
const WR_ID_KIND_MASK: u64 = 0xF000_0000_0000_0000;
/// Bit 31 of the immediate separates control messages from chunk sequence numbers
const IMM_CONTROL_BIT: u32 = 1 << 31;
/// Control kind lives in bits 16..31 of the immediate
const IMM_KIND_SHIFT: u32 = 16;
/// Kind field width once shifted down
const IMM_KIND_MASK: u32 = 0x7FFF;
/// Peer id lives in the low 16 bits of a control immediate
const IMM_PEER_MASK: u32 = 0xFFFF;

/// Peer index inside a [`crate::PeerSet`]
pub type PeerId = u16;

/// Control signals of the rendezvous and termination protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    /// Rendezvous, the responder is ready for data
    Start,
    /// Termination, the responder received what it expected
    Stop,
}

impl ControlKind {
    /// Wire code of the signal
    #[inline]
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Start => MSG_CLIENT_START,
            Self::Stop => MSG_CLIENT_STOP,
        }
    }
}

/// Application message carried in the immediate data of a send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImmMessage {
    /// A control signal addressed to (or coming from) one peer
    Control {
        /// Start or stop
        kind: ControlKind,
        /// The peer the signal concerns
        peer: PeerId,
    },
    /// Bulk data, numbered per destination
    Chunk {
        /// Running sequence number, below 2^31
        seq: u32,
    },
}

impl ImmMessage {
    /// Encode into the 32-bit immediate
    #[inline]
    pub fn encode(self) -> Result<u32> {
        match self {
            Self::Control { kind, peer } => {
                Ok(IMM_CONTROL_BIT | (kind.code() << IMM_KIND_SHIFT) | u32::from(peer))
            }
            Self::Chunk { seq } => {
                if seq & IMM_CONTROL_BIT != 0 {
                    return Err(Error::Protocol(format!(
                        "chunk sequence number {seq} does not fit in 31 bits"
                    )));
                }
                Ok(seq)
            }
        }
    }

    /// Decode a 32-bit immediate
    #[inline]
    pub fn decode(imm: u32) -> Result<Self> {
        if imm & IMM_CONTROL_BIT == 0 {
            return Ok(Self::Chunk { seq: imm });
        }
        let code = (imm >> IMM_KIND_SHIFT) & IMM_KIND_MASK;
        let kind = match code {
            MSG_CLIENT_START => ControlKind::Start,
            MSG_CLIENT_STOP => ControlKind::Stop,
            _ => {
                return Err(Error::Protocol(format!(
                    "unknown control code {code} in immediate {imm:#x}"
                )))
            }
        };
        #[allow(clippy::as_conversions, clippy::cast_possible_truncation)] // masked to 16 bits
        let peer = (imm & IMM_PEER_MASK) as PeerId;
        Ok(Self::Control { kind, peer })
    }

    /// Shorthand for a start signal
    #[inline]
    #[must_use]
    pub const fn start(peer: PeerId) -> Self {
        Self::Control {
            kind: ControlKind::Start,
            peer,
        }
    }

    /// Shorthand for a stop signal
    #[inline]
    #[must_use]
    pub const fn stop(peer: PeerId) -> Self {
        Self::Control {
            kind: ControlKind::Stop,
            peer,
        }
    }
}

/// Work request id
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub struct WorkRequestId(u64);

impl From<u64> for WorkRequestId {
    #[inline]
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<WorkRequestId> for u64 {
    #[inline]
    fn from(wr_id: WorkRequestId) -> Self {
        wr_id.0
    }
}

impl fmt::Display for WorkRequestId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// What a work request id points back to.
///
/// The high nibble of the raw id selects the kind and the low bits carry the payload. A slot id
/// is the bare slot index. Control sends OR the peer into the low 16 bits of their sentinel, so
/// the stop send towards peer 3 has the id `IB_WR_ID_STOP | 3` and only peer 0 carries the plain
/// [`IB_WR_ID_STOP`]. Match on [`WorkRequestId::tag`] rather than comparing raw ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkRequestTag {
    /// A buffer slot of the registered region
    Slot(u32),
    /// The rendezvous send towards a peer, `IB_WR_ID_START | peer`
    Start(PeerId),
    /// The termination send towards a peer, `IB_WR_ID_STOP | peer`
    Stop(PeerId),
}

impl From<WorkRequestTag> for WorkRequestId {
    #[inline]
    fn from(tag: WorkRequestTag) -> Self {
        let raw = match tag {
            WorkRequestTag::Slot(index) => u64::from(index),
            WorkRequestTag::Start(peer) => IB_WR_ID_START | u64::from(peer),
            WorkRequestTag::Stop(peer) => IB_WR_ID_STOP | u64::from(peer),
        };
        Self(raw)
    }
}

impl WorkRequestId {
    /// Recover the tag, `None` for ids this transport never hands out
    #[inline]
    #[must_use]
    pub fn tag(self) -> Option<WorkRequestTag> {
        let low = self.0 & !WR_ID_KIND_MASK;
        match self.0 & WR_ID_KIND_MASK {
            0 => u32::try_from(low).ok().map(WorkRequestTag::Slot),
            IB_WR_ID_START => PeerId::try_from(low).ok().map(WorkRequestTag::Start),
            IB_WR_ID_STOP => PeerId::try_from(low).ok().map(WorkRequestTag::Stop),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_has_high_bit() {
        let start = ImmMessage::start(2).encode().unwrap();
        assert_ne!(start & IMM_CONTROL_BIT, 0);
        assert_eq!((start >> IMM_KIND_SHIFT) & IMM_KIND_MASK, MSG_CLIENT_START);
        assert_eq!(ImmMessage::decode(start).unwrap(), ImmMessage::start(2));

        let stop = ImmMessage::stop(u16::MAX).encode().unwrap();
        assert_eq!(ImmMessage::decode(stop).unwrap(), ImmMessage::stop(u16::MAX));
    }

    #[test]
    fn chunk_seq_never_collides_with_control() {
        // a chunk numbered like the bare start code stays a chunk
        let chunk = ImmMessage::Chunk {
            seq: MSG_CLIENT_START,
        };
        let raw = chunk.encode().unwrap();
        assert_eq!(raw, MSG_CLIENT_START);
        assert_eq!(ImmMessage::decode(raw).unwrap(), chunk);
        assert!(ImmMessage::Chunk { seq: 1 << 31 }.encode().is_err());
    }

    #[test]
    fn unknown_control_code_is_rejected() {
        let raw = IMM_CONTROL_BIT | (7 << IMM_KIND_SHIFT);
        assert!(matches!(ImmMessage::decode(raw), Err(Error::Protocol(_))));
    }

    #[test]
    fn wr_id_tags() {
        let stop = WorkRequestId::from(WorkRequestTag::Stop(3));
        assert_eq!(u64::from(stop), IB_WR_ID_STOP | 3);
        assert_eq!(stop.tag(), Some(WorkRequestTag::Stop(3)));

        let start = WorkRequestId::from(WorkRequestTag::Start(0));
        assert_eq!(start.tag(), Some(WorkRequestTag::Start(0)));

        let slot = WorkRequestId::from(WorkRequestTag::Slot(42));
        assert_eq!(u64::from(slot), 42);
        assert_eq!(slot.tag(), Some(WorkRequestTag::Slot(42)));

        assert_eq!(WorkRequestId::from(0x1000_0000_0000_0000).tag(), None);
        assert_eq!(WorkRequestId::from(IB_WR_ID_STOP | 0x1_0000).tag(), None);
    }
}
