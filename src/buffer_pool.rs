use std::{collections::VecDeque, ops::Range};

use crate::error::{Error, Result};

/// What an in-flight slot is being used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotUse {
    /// Posted as a receive buffer
    Recv,
    /// Holding an outgoing chunk
    Send,
}

/// Splits the registered region into fixed-size slots handed out from a free list.
///
/// A slot stays in flight from the moment its request is posted until its completion is
/// consumed. Only then can it be handed out again.
#[derive(Debug)]
pub struct SlotPool {
    /// Bytes per slot
    slot_size: usize,
    /// Indices ready for use, oldest first
    free: VecDeque<u32>,
    /// `Some` while the slot is posted
    in_flight: Vec<Option<SlotUse>>,
}

impl SlotPool {
    /// Carve `region_len` bytes into `slot_count` equal slots. Trailing bytes are unused.
    #[inline]
    pub fn new(region_len: usize, slot_count: u32) -> Result<Self> {
        let count = usize::try_from(slot_count)
            .map_err(|_| Error::Config(format!("slot count {slot_count} is too large")))?;
        let slot_size = region_len.checked_div(count).unwrap_or(0);
        if slot_size == 0 {
            return Err(Error::Config(format!(
                "{region_len} bytes cannot be split into {slot_count} slots"
            )));
        }
        Ok(Self {
            slot_size,
            free: (0..slot_count).collect(),
            in_flight: vec![None; count],
        })
    }

    /// Bytes per slot
    #[inline]
    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of slots
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of slots ready for use
    #[inline]
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Take a free slot for `usage`, `None` when all are in flight
    #[inline]
    pub fn acquire(&mut self, usage: SlotUse) -> Option<u32> {
        let index = self.free.pop_front()?;
        if let Some(state) = self.in_flight.get_mut(usize::try_from(index).ok()?) {
            *state = Some(usage);
        }
        Some(index)
    }

    /// Return a slot whose completion has been consumed, reporting what it was used for
    #[inline]
    pub fn release(&mut self, index: u32) -> Result<SlotUse> {
        let usage = usize::try_from(index)
            .ok()
            .and_then(|i| self.in_flight.get_mut(i))
            .and_then(Option::take)
            .ok_or_else(|| {
                Error::Protocol(format!("completion for slot {index} that is not in flight"))
            })?;
        self.free.push_back(index);
        Ok(usage)
    }

    /// Byte range of a slot inside the region
    #[inline]
    #[must_use]
    pub fn range(&self, index: u32) -> Range<usize> {
        let start = usize::try_from(index)
            .unwrap_or(usize::MAX)
            .saturating_mul(self.slot_size);
        start..start.saturating_add(self.slot_size)
    }
}
