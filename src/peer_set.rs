use tracing::warn;

use crate::{
    error::{Error, Result},
    message::PeerId,
};

/// Outcome of recording a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First signal from this peer
    New,
    /// The peer was already recorded, nothing counted
    Duplicate,
}

/// Which of a fixed number of peers have been heard from
#[derive(Debug, Clone)]
pub struct PeerSet {
    /// One flag per peer id
    seen: Vec<bool>,
    /// Number of `true` flags
    count: usize,
}

impl PeerSet {
    /// An empty set over peers `0..peer_num`
    #[inline]
    #[must_use]
    pub fn new(peer_num: u16) -> Self {
        Self {
            seen: vec![false; usize::from(peer_num)],
            count: 0,
        }
    }

    /// Record `peer`. Out-of-range ids break the protocol.
    #[inline]
    pub fn insert(&mut self, peer: PeerId) -> Result<Admission> {
        let expected = self.seen.len();
        let flag = self.seen.get_mut(usize::from(peer)).ok_or_else(|| {
            Error::Protocol(format!("peer {peer} is outside the {expected} known peers"))
        })?;
        if *flag {
            warn!("duplicate signal from peer {}, ignored", peer);
            return Ok(Admission::Duplicate);
        }
        *flag = true;
        self.count = self.count.saturating_add(1);
        Ok(Admission::New)
    }

    /// Whether `peer` has been recorded
    #[inline]
    #[must_use]
    pub fn contains(&self, peer: PeerId) -> bool {
        self.seen.get(usize::from(peer)).copied().unwrap_or(false)
    }

    /// Number of distinct peers recorded
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether no peer has been recorded
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Whether every peer has been recorded
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.count == self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_do_not_complete_the_set() {
        let mut set = PeerSet::new(3);
        assert_eq!(set.insert(2).unwrap(), Admission::New);
        assert_eq!(set.insert(2).unwrap(), Admission::Duplicate);
        assert_eq!(set.insert(0).unwrap(), Admission::New);
        assert_eq!(set.insert(0).unwrap(), Admission::Duplicate);
        assert_eq!(set.len(), 2);
        assert!(!set.is_complete());
        assert_eq!(set.insert(1).unwrap(), Admission::New);
        assert!(set.is_complete());
        assert!(set.contains(1));
    }

    #[test]
    fn out_of_range_peer() {
        let mut set = PeerSet::new(1);
        assert!(matches!(set.insert(1), Err(Error::Protocol(_))));
        assert!(set.is_empty());
    }
}
