//! Heap-backed bitmap used by the buddy allocator to track split/allocated
//! blocks at every granularity.

use crate::error::{Error, Result};

/// Fixed-length bitmap stored in 64-bit words.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// Create a bitmap of `len` bits, all clear.
    ///
    /// Fails with `OutOfMemory` if the backing words cannot be reserved.
    pub fn new(len: usize) -> Result<Self> {
        let nwords = len.div_ceil(64);
        let mut words = Vec::new();
        words
            .try_reserve_exact(nwords)
            .map_err(|_| Error::OutOfMemory)?;
        words.resize(nwords, 0);
        Ok(Self { words, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.len, "bit {index} out of range");
        self.words[index / 64] |= 1u64 << (index % 64);
    }

    #[inline]
    pub fn clear(&mut self, index: usize) {
        debug_assert!(index < self.len, "bit {index} out of range");
        self.words[index / 64] &= !(1u64 << (index % 64));
    }

    #[inline]
    pub fn test(&self, index: usize) -> bool {
        debug_assert!(index < self.len, "bit {index} out of range");
        self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}
