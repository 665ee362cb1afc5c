use std::fmt;

use rdma_sys::ibv_gid;
use serde::{Deserialize, Serialize};

/// A 128-bit identifier used to identify a Port on a network adapter, a port on a Router,
/// or a Multicast Group.
///
/// The bytes are kept exactly as the device reports them. No endianness conversion happens
/// when a `Gid` is copied, serialized or handed back to the device.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Gid(ibv_gid);

impl Gid {
    /// Build [`Gid`] from bytes
    #[inline]
    #[must_use]
    pub fn from_raw(raw: [u8; 16]) -> Self {
        Self(ibv_gid { raw })
    }

    /// Re-interprets [`&Gid`](Gid) as `&[u8;16]`.
    #[inline]
    #[must_use]
    pub fn as_raw(&self) -> &[u8; 16] {
        // SAFETY: POD type
        unsafe { &self.0.raw }
    }

    /// Whether every byte is zero, i.e. the gid was never filled in
    #[inline]
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.as_raw().iter().all(|b| *b == 0)
    }
}

impl Default for Gid {
    #[inline]
    fn default() -> Self {
        Self::from_raw([0_u8; 16])
    }
}

impl fmt::Debug for Gid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gid({})", self)
    }
}

impl fmt::Display for Gid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.as_raw()))
    }
}

impl PartialEq for Gid {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.as_raw() == other.as_raw()
    }
}

impl Eq for Gid {}

impl From<ibv_gid> for Gid {
    #[inline]
    fn from(gid: ibv_gid) -> Self {
        Self(gid)
    }
}

impl From<Gid> for ibv_gid {
    #[inline]
    fn from(gid: Gid) -> Self {
        gid.0
    }
}

impl AsMut<ibv_gid> for Gid {
    #[inline]
    fn as_mut(&mut self) -> &mut ibv_gid {
        // SAFETY: repr(transparent)
        unsafe { &mut *<*mut Self>::cast::<ibv_gid>(self) }
    }
}

impl Serialize for Gid {
    #[inline]
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        <[u8; 16] as Serialize>::serialize(self.as_raw(), serializer)
    }
}

impl<'de> Deserialize<'de> for Gid {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        <[u8; 16] as Deserialize<'de>>::deserialize(deserializer).map(Self::from_raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repr_check() {
        use std::mem::{align_of, size_of};
        assert_eq!(size_of::<Gid>(), size_of::<ibv_gid>());
        assert_eq!(align_of::<Gid>(), align_of::<ibv_gid>());
    }

    #[test]
    fn raw_bytes_survive_ibv_conversion() {
        let mut raw = [0_u8; 16];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = u8::try_from(i).unwrap().wrapping_mul(17).wrapping_add(1);
        }
        let gid = Gid::from_raw(raw);
        let back: Gid = ibv_gid::from(gid).into();
        assert_eq!(back.as_raw(), &raw);
        assert!(!back.is_zero());
        assert!(Gid::default().is_zero());
    }

    #[test]
    fn display_is_lower_hex() {
        let gid = Gid::from_raw([
            0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0x02, 0x1a, 0x4b, 0xff, 0xfe, 0x01, 0x02, 0x03,
        ]);
        assert_eq!(gid.to_string(), "fe80000000000000021a4bfffe010203");
    }
}
