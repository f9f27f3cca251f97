//! Buddy Allocator - carves a caller-owned region into power-of-two blocks.
//!
//! The region is split into `len / max` top-level blocks which are split on
//! demand down to `MIN_BLOCK_SIZE`. Free blocks of each size sit on their own
//! [`IndexList`]; the links are kept in a side table with one entry per
//! minimum-size unit, so nothing is ever written into the managed memory.
//!
//! # Bitmap Layout
//!
//! ```text
//! ┌──┬──┬──┬──┬──┬──┬──┬──┬──┬──┬──┬──┬──┬──┬──┐
//! │16│16│16│16│..│32│32│32│32│..│64│64│64│64│..│
//! └──┴──┴──┴──┴──┴──┴──┴──┴──┴──┴──┴──┴──┴──┴──┘
//! ```
//!
//! Every granularity owns a disjoint range of bits, `2 * len / min` bits in
//! total. A set bit means the block at that granularity is split or
//! allocated; a clear bit means it is a whole free block. That lets `free`
//! decide in O(1) whether the buddy can be merged.
//!
//! A set bit alone cannot tell an allocated block from a split ancestor, so
//! each allocated block also records its level in a per-unit side table.
//! `free` rejects a length whose block size differs from the recorded one.

use tracing::{trace, warn};

use crate::bitmap::Bitmap;
use crate::error::{Error, Result};
use crate::index_list::{IndexList, Link};

/// Smallest block handed out. Fixed, independent of pointer width.
pub const MIN_BLOCK_SIZE: usize = 16;

/// Which end of a free list `alloc` consumes from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExtractPolicy {
    /// Odd levels take from the tail, even levels from the head, so buddies
    /// published by a split tend to be handed out from opposite ends.
    #[default]
    Alternating,
    /// Always take the head.
    HeadOnly,
}

/// Power-of-two block allocator over a fixed address range.
pub struct BuddyAllocator {
    /// Start address of the managed region
    base: usize,
    /// Total managed bytes
    len: usize,
    /// Smallest block size (always `MIN_BLOCK_SIZE`)
    min: usize,
    /// Largest block size
    max: usize,
    /// `lists[i]` holds free blocks of size `min << i`
    lists: Vec<IndexList>,
    /// Free-list links, one per `min`-sized unit
    links: Vec<Link>,
    /// Level + 1 of the block allocated at each unit, 0 if none
    levels: Vec<u8>,
    bitmap: Bitmap,
    policy: ExtractPolicy,
}

impl BuddyAllocator {
    /// Create an allocator over `[base, base + len)` with largest block `max`.
    ///
    /// # Errors
    /// `InvalidArgument` if `base` is zero, `len` or `max` is zero, `max`
    /// exceeds `len`, `max` is not a power of two or is smaller than
    /// `MIN_BLOCK_SIZE`, or `len` is not a multiple of `max`.
    /// `OutOfMemory` if the metadata cannot be reserved.
    pub fn new(base: usize, len: usize, max: usize) -> Result<Self> {
        Self::with_policy(base, len, max, ExtractPolicy::default())
    }

    /// Same as [`BuddyAllocator::new`] with an explicit extraction policy.
    pub fn with_policy(base: usize, len: usize, max: usize, policy: ExtractPolicy) -> Result<Self> {
        let min = MIN_BLOCK_SIZE;

        if base == 0
            || len == 0
            || max == 0
            || max > len
            || !max.is_power_of_two()
            || max < min
            || len % max != 0
            || base.checked_add(len).is_none()
            || len / min >= u32::MAX as usize
        {
            warn!(base, len, max, "invalid parameter to buddy allocator create");
            return Err(Error::InvalidArgument);
        }

        let nlists = (max / min).trailing_zeros() as usize + 1;
        let units = len / min;

        let mut lists = Vec::new();
        lists
            .try_reserve_exact(nlists)
            .map_err(|_| Error::OutOfMemory)?;
        lists.resize(nlists, IndexList::new());

        let mut links = Vec::new();
        links
            .try_reserve_exact(units)
            .map_err(|_| Error::OutOfMemory)?;
        links.resize(units, Link::UNLINKED);

        let mut levels = Vec::new();
        levels
            .try_reserve_exact(units)
            .map_err(|_| Error::OutOfMemory)?;
        levels.resize(units, 0);

        let bitmap = Bitmap::new(2 * units)?;

        let mut allocator = Self {
            base,
            len,
            min,
            max,
            lists,
            links,
            levels,
            bitmap,
            policy,
        };

        // Top list starts with every max-sized block, in address order
        let top = nlists - 1;
        for k in 0..len / max {
            let unit = allocator.unit(base + k * max);
            allocator.lists[top].push_back(&mut allocator.links, unit);
        }

        Ok(allocator)
    }

    /// Create an allocator over a byte region.
    ///
    /// The allocator only records the region's address; the caller keeps the
    /// region alive for as long as addresses handed out are in use.
    pub fn from_region(region: &[u8], max: usize) -> Result<Self> {
        Self::new(region.as_ptr() as usize, region.len(), max)
    }

    /// Allocate a block large enough for `length` bytes.
    ///
    /// Returns the block address, aligned (relative to `base`) to the block
    /// size `block_size_for(length)`.
    pub fn alloc(&mut self, length: usize) -> Result<usize> {
        if length == 0 || length > self.max {
            warn!(length, max = self.max, "invalid parameter to buddy alloc");
            return Err(Error::InvalidArgument);
        }

        let bsize = self.block_size_for(length);
        let i = self.list_index(bsize);

        if self.lists[i].is_empty() && !self.find_block(i) {
            warn!(length, bsize, "could not allocate buddy block");
            return Err(Error::OutOfMemory);
        }

        let take_tail = self.policy == ExtractPolicy::Alternating && i % 2 == 1;
        let unit = if take_tail {
            self.lists[i].pop_back(&mut self.links)
        } else {
            self.lists[i].pop_front(&mut self.links)
        }
        .ok_or(Error::OutOfMemory)?;

        let addr = self.addr_of(unit);
        let bit = self.bitmap_index(addr, bsize);
        self.bitmap.set(bit);
        self.levels[unit as usize] = i as u8 + 1;

        trace!(addr, bsize, "buddy alloc");
        Ok(addr)
    }

    /// Return a block obtained from [`alloc`](Self::alloc) with the same
    /// `length`, coalescing with free buddies as far as possible.
    pub fn free(&mut self, addr: usize, length: usize) -> Result<()> {
        if length == 0
            || length > self.max
            || addr < self.base
            || addr >= self.base + self.len
        {
            warn!(addr, length, "invalid parameter to buddy free");
            return Err(Error::InvalidArgument);
        }

        let mut bsize = self.block_size_for(length);
        let mut addr = addr;

        if (addr - self.base) % bsize != 0 {
            warn!(addr, bsize, "misaligned buddy free");
            return Err(Error::InvalidArgument);
        }

        let unit = self.unit(addr) as usize;
        let level = self.list_index(bsize);
        let bit = self.bitmap_index(addr, bsize);
        if self.levels[unit] != level as u8 + 1 || !self.bitmap.test(bit) {
            warn!(addr, bsize, "buddy free of a block that is not allocated");
            return Err(Error::InvalidArgument);
        }
        self.levels[unit] = 0;
        self.bitmap.clear(bit);

        while bsize < self.max {
            let buddy = self.buddy_of(addr, bsize);
            if self.bitmap.test(self.bitmap_index(buddy, bsize)) {
                break;
            }

            let level = self.list_index(bsize);
            let buddy_unit = self.unit(buddy);
            self.lists[level].remove(&mut self.links, buddy_unit);

            addr = addr.min(buddy);
            bsize *= 2;

            let merged = self.bitmap_index(addr, bsize);
            self.bitmap.clear(merged);
        }

        let level = self.list_index(bsize);
        let unit = self.unit(addr);
        self.lists[level].push_back(&mut self.links, unit);

        trace!(addr, bsize, "buddy free");
        Ok(())
    }

    // ========================================================================
    // Splitting
    // ========================================================================

    /// Find the first non-empty list above `i` and split one of its blocks
    /// down to level `i`. Returns `false` if every larger list is empty.
    fn find_block(&mut self, i: usize) -> bool {
        match (i + 1..self.lists.len()).find(|&j| !self.lists[j].is_empty()) {
            Some(j) => {
                self.split(j, i);
                true
            }
            None => false,
        }
    }

    /// Split the head block of list `j` until level `i` is reached.
    ///
    /// Upper halves are published at the tail of each intermediate level. The
    /// final pair lands on list `i`: the lower half at the head, its buddy at
    /// the tail.
    fn split(&mut self, j: usize, i: usize) {
        let Some(unit) = self.lists[j].pop_front(&mut self.links) else {
            return;
        };
        let addr = self.addr_of(unit);

        let bit = self.bitmap_index(addr, self.level_size(j));
        self.bitmap.set(bit);

        let mut level = j - 1;
        while level > i {
            let size = self.level_size(level);
            let upper = addr + size;

            let kept = self.bitmap_index(addr, size);
            self.bitmap.set(kept);
            let published = self.bitmap_index(upper, size);
            self.bitmap.clear(published);

            let upper_unit = self.unit(upper);
            self.lists[level].push_back(&mut self.links, upper_unit);
            level -= 1;
        }

        let size = self.level_size(i);
        let upper = addr + size;
        let lower_bit = self.bitmap_index(addr, size);
        let upper_bit = self.bitmap_index(upper, size);
        self.bitmap.clear(lower_bit);
        self.bitmap.clear(upper_bit);

        let upper_unit = self.unit(upper);
        self.lists[i].push_front(&mut self.links, unit);
        self.lists[i].push_back(&mut self.links, upper_unit);
    }

    // ========================================================================
    // Index Arithmetic
    // ========================================================================

    /// Block size serving a request of `length` bytes.
    #[inline]
    pub fn block_size_for(&self, length: usize) -> usize {
        length.next_power_of_two().max(self.min)
    }

    #[inline]
    fn list_index(&self, bsize: usize) -> usize {
        (bsize / self.min).trailing_zeros() as usize
    }

    #[inline]
    fn level_size(&self, level: usize) -> usize {
        self.min << level
    }

    #[inline]
    fn unit(&self, addr: usize) -> u32 {
        ((addr - self.base) / self.min) as u32
    }

    #[inline]
    fn addr_of(&self, unit: u32) -> usize {
        self.base + unit as usize * self.min
    }

    #[inline]
    fn buddy_of(&self, addr: usize, bsize: usize) -> usize {
        self.base + ((addr - self.base) ^ bsize)
    }

    /// Bit tracking the block at `addr` with size `bsize`.
    ///
    /// Level `l` (size `min << l`) starts at bit `2N - 2N / 2^l`, where
    /// `N = len / min`.
    #[inline]
    fn bitmap_index(&self, addr: usize, bsize: usize) -> usize {
        let units = self.len / self.min;
        (addr - self.base) / bsize + 2 * units - 2 * (self.len / bsize)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    #[inline]
    pub fn base(&self) -> usize {
        self.base
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
    pub fn min(&self) -> usize {
        self.min
    }

    #[inline]
    pub fn max(&self) -> usize {
        self.max
    }

    #[inline]
    pub fn nlists(&self) -> usize {
        self.lists.len()
    }

    #[inline]
    pub fn policy(&self) -> ExtractPolicy {
        self.policy
    }

    /// Addresses on the free list of `level`, in list order.
    pub fn free_blocks(&self, level: usize) -> Vec<usize> {
        self.lists
            .get(level)
            .map(|list| list.iter(&self.links).map(|u| self.addr_of(u)).collect())
            .unwrap_or_default()
    }

    /// Number of free blocks on the list of `level`.
    pub fn free_count(&self, level: usize) -> u32 {
        self.lists.get(level).map_or(0, |list| list.len())
    }

    /// Total bytes sitting on free lists.
    pub fn free_bytes(&self) -> usize {
        self.lists
            .iter()
            .enumerate()
            .map(|(level, list)| list.len() as usize * self.level_size(level))
            .sum()
    }

    /// True when every top-level block is free and whole.
    pub fn is_fully_coalesced(&self) -> bool {
        let top = self.lists.len() - 1;
        self.lists[top].len() as usize == self.len / self.max
            && self.lists[..top].iter().all(IndexList::is_empty)
    }

    /// Hash of the free sets (order-insensitive) and the bitmap, for
    /// determinism testing.
    pub fn state_hash(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        let mut units = Vec::new();
        for (level, list) in self.lists.iter().enumerate() {
            units.clear();
            units.extend(list.iter(&self.links));
            units.sort_unstable();
            units.hash(&mut hasher);
            level.hash(&mut hasher);
        }
        self.bitmap.hash(&mut hasher);
        hasher.finish()
    }
}

impl std::fmt::Debug for BuddyAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &self.len)
            .field("min", &self.min)
            .field("max", &self.max)
            .field("nlists", &self.lists.len())
            .field("free_bytes", &self.free_bytes())
            .finish()
    }
}
