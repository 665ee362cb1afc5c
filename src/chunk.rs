use crate::error::{Error, Result};

/// How a file of `file_size` bytes is cut into sends of at most `chunk_size` bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    /// Total bytes
    file_size: u64,
    /// Bytes per full chunk
    chunk_size: u64,
}

impl ChunkPlan {
    /// Plan a transfer, `chunk_size` must be positive
    #[inline]
    pub fn new(file_size: u64, chunk_size: usize) -> Result<Self> {
        let chunk_size = u64::try_from(chunk_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| Error::Config(format!("invalid chunk size {chunk_size}")))?;
        Ok(Self {
            file_size,
            chunk_size,
        })
    }

    /// `ceil(file_size / chunk_size)`
    #[inline]
    #[must_use]
    pub fn count(&self) -> u64 {
        let full = self.file_size.wrapping_div(self.chunk_size);
        if self.file_size.wrapping_rem(self.chunk_size) == 0 {
            full
        } else {
            full.saturating_add(1)
        }
    }

    /// Length of chunk `index`, the last one holding the remainder. Zero past the end.
    #[inline]
    #[must_use]
    pub fn len(&self, index: u64) -> u64 {
        let start = index.saturating_mul(self.chunk_size);
        self.file_size.saturating_sub(start).min(self.chunk_size)
    }

    /// Whether there is nothing to send
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.file_size == 0
    }

    /// Lengths of all chunks in order
    #[inline]
    pub fn lens(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.count()).map(move |index| self.len(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lens(file_size: u64, chunk_size: usize) -> Vec<u64> {
        ChunkPlan::new(file_size, chunk_size).unwrap().lens().collect()
    }

    #[test]
    fn remainder_goes_last() {
        assert_eq!(ChunkPlan::new(10, 4).unwrap().count(), 3);
        assert_eq!(lens(10, 4), vec![4, 4, 2]);
    }

    #[test]
    fn exact_multiple() {
        assert_eq!(ChunkPlan::new(12, 4).unwrap().count(), 3);
        assert_eq!(lens(12, 4), vec![4, 4, 4]);
    }

    #[test]
    fn empty_file() {
        let plan = ChunkPlan::new(0, 4).unwrap();
        assert_eq!(plan.count(), 0);
        assert!(plan.is_empty());
        assert!(lens(0, 4).is_empty());
    }

    #[test]
    fn zero_chunk_size() {
        assert!(matches!(ChunkPlan::new(10, 0), Err(Error::Config(_))));
    }
}
