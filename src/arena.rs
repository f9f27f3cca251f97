//! Entry Arena - fixed-capacity pool of operation entries.
//!
//! The arena pre-allocates every entry at endpoint creation, so posting an
//! operation never touches the heap. Free slots are threaded through their
//! `next` link; allocated slots reuse the same link for membership in a
//! posted list or a multi-recv consumer list.
//!
//! Handles are generation checked: freeing a slot bumps its generation, so
//! an [`EntryId`] or [`ClaimTicket`] that outlived its entry is rejected
//! instead of aliasing the slot's next occupant.

use std::fmt;

use crate::entry::{EntryState, OpEntry};
use crate::index_list::{Link, LinkStore, NULL_INDEX};

/// Generation-checked handle to an entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

impl EntryId {
    /// Handle that never resolves.
    pub const INVALID: EntryId = EntryId {
        index: NULL_INDEX,
        generation: 0,
    };

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl Default for EntryId {
    fn default() -> Self {
        EntryId::INVALID
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({}v{})", self.index, self.generation)
    }
}

/// Proof that a peeked unexpected message was claimed.
///
/// Only the engine creates tickets; passing one back through a `CLAIM`
/// receive consumes the claimed message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClaimTicket {
    id: EntryId,
}

impl ClaimTicket {
    #[inline]
    pub(crate) const fn new(id: EntryId) -> Self {
        Self { id }
    }

    #[inline]
    pub const fn entry(self) -> EntryId {
        self.id
    }
}

struct Slot {
    entry: OpEntry,
    link: Link,
    generation: u32,
    in_use: bool,
}

/// Pre-allocated entry pool with O(1) allocation and deallocation.
pub struct EntryArena {
    slots: Vec<Slot>,
    /// Head of the free list
    free_head: u32,
    allocated: u32,
    capacity: u32,
}

impl EntryArena {
    /// Create an arena holding `capacity` entries.
    ///
    /// `capacity` must be below `NULL_INDEX`; configuration validation
    /// guarantees that before an endpoint builds its pools.
    pub fn new(capacity: u32) -> Self {
        debug_assert!(capacity < NULL_INDEX);

        let mut slots = Vec::with_capacity(capacity as usize);
        for i in 0..capacity {
            let next = if i + 1 < capacity { i + 1 } else { NULL_INDEX };
            slots.push(Slot {
                entry: OpEntry::default(),
                link: Link {
                    next,
                    prev: NULL_INDEX,
                },
                generation: 0,
                in_use: false,
            });
        }

        Self {
            slots,
            free_head: if capacity > 0 { 0 } else { NULL_INDEX },
            allocated: 0,
            capacity,
        }
    }

    /// Allocate a reset entry. Returns `None` when the pool is exhausted.
    ///
    /// # Complexity
    /// O(1) - pops from head of free list
    #[inline]
    pub fn alloc(&mut self) -> Option<EntryId> {
        if self.free_head == NULL_INDEX {
            return None;
        }

        let index = self.free_head;
        let slot = &mut self.slots[index as usize];
        self.free_head = slot.link.next;
        slot.link = Link::UNLINKED;
        slot.in_use = true;

        let id = EntryId {
            index,
            generation: slot.generation,
        };
        slot.entry = OpEntry {
            id,
            ..OpEntry::default()
        };
        self.allocated += 1;

        Some(id)
    }

    /// Return an entry to the pool. Returns `false` for a stale handle.
    ///
    /// # Complexity
    /// O(1) - pushes to head of free list
    #[inline]
    pub fn free(&mut self, id: EntryId) -> bool {
        if !self.is_live(id) {
            return false;
        }

        let slot = &mut self.slots[id.index as usize];
        slot.entry.reset();
        slot.entry.state = EntryState::Free;
        slot.generation = slot.generation.wrapping_add(1);
        slot.in_use = false;
        slot.link = Link {
            next: self.free_head,
            prev: NULL_INDEX,
        };
        self.free_head = id.index;
        self.allocated -= 1;
        true
    }

    /// Whether `id` refers to a currently allocated entry.
    #[inline]
    pub fn is_live(&self, id: EntryId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.in_use && slot.generation == id.generation)
    }

    #[inline]
    pub fn get(&self, id: EntryId) -> Option<&OpEntry> {
        if self.is_live(id) {
            Some(&self.slots[id.index as usize].entry)
        } else {
            None
        }
    }

    #[inline]
    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut OpEntry> {
        if self.is_live(id) {
            Some(&mut self.slots[id.index as usize].entry)
        } else {
            None
        }
    }

    /// Entry at a raw list index. Only valid for indices taken from a list
    /// threaded through this arena.
    #[inline]
    pub fn at(&self, index: u32) -> &OpEntry {
        debug_assert!(self.slots[index as usize].in_use);
        &self.slots[index as usize].entry
    }

    #[inline]
    pub fn at_mut(&mut self, index: u32) -> &mut OpEntry {
        debug_assert!(self.slots[index as usize].in_use);
        &mut self.slots[index as usize].entry
    }

    #[inline]
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.allocated == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.free_head == NULL_INDEX
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &OpEntry> {
        self.slots
            .iter()
            .filter(|slot| slot.in_use)
            .map(|slot| &slot.entry)
    }
}

impl LinkStore for EntryArena {
    #[inline]
    fn link(&self, index: u32) -> &Link {
        &self.slots[index as usize].link
    }

    #[inline]
    fn link_mut(&mut self, index: u32) -> &mut Link {
        &mut self.slots[index as usize].link
    }
}

impl fmt::Debug for EntryArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryArena")
            .field("capacity", &self.capacity)
            .field("allocated", &self.allocated)
            .field("free_head", &self.free_head)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_list::IndexList;

    #[test]
    fn test_arena_creation() {
        let arena = EntryArena::new(100);
        assert_eq!(arena.capacity(), 100);
        assert_eq!(arena.allocated(), 0);
        assert!(!arena.is_full());
        assert!(arena.is_empty());
    }

    #[test]
    fn test_arena_alloc_free() {
        let mut arena = EntryArena::new(3);

        let id0 = arena.alloc().expect("Should allocate");
        let id1 = arena.alloc().expect("Should allocate");
        let id2 = arena.alloc().expect("Should allocate");

        assert_eq!(arena.allocated(), 3);
        assert!(arena.is_full());
        assert!(arena.alloc().is_none(), "Should be full");

        assert!(arena.free(id1));
        assert_eq!(arena.allocated(), 2);

        // Slot is reused with a new generation
        let id3 = arena.alloc().expect("Should allocate");
        assert_eq!(id3.index(), id1.index());
        assert_ne!(id3, id1);

        assert!(arena.free(id0));
        assert!(arena.free(id2));
        assert!(arena.free(id3));
        assert!(arena.is_empty());
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut arena = EntryArena::new(2);
        let id = arena.alloc().unwrap();
        arena.get_mut(id).unwrap().tag = 42;
        assert_eq!(arena.get(id).unwrap().id, id);

        assert!(arena.free(id));
        assert!(arena.get(id).is_none());
        assert!(!arena.free(id), "double free must be rejected");
        assert!(arena.get(EntryId::INVALID).is_none());

        let again = arena.alloc().unwrap();
        assert_eq!(arena.get(again).unwrap().tag, 0, "entry is reset");
    }

    #[test]
    fn test_entries_link_into_lists() {
        let mut arena = EntryArena::new(4);
        let ids: Vec<_> = (0..3).map(|_| arena.alloc().unwrap()).collect();

        let mut list = IndexList::new();
        for id in &ids {
            list.push_back(&mut arena, id.index());
        }
        let order: Vec<u32> = list.iter(&arena).collect();
        assert_eq!(order, ids.iter().map(|id| id.index()).collect::<Vec<_>>());

        list.remove(&mut arena, ids[1].index());
        assert_eq!(list.len(), 2);
        assert_eq!(arena.at(list.tail().unwrap()).id, ids[2]);
    }
}
