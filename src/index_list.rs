//! Index List - a doubly-linked list threaded through an index-addressed
//! link store.
//!
//! Nodes are plain `u32` indices; the `next`/`prev` links live in whatever
//! implements [`LinkStore`] (the entry arena, or the buddy allocator's
//! per-unit link table). Insertion at either end, removal from either end
//! and removal from an arbitrary position are all O(1).

/// Sentinel value representing a null/invalid index (like nullptr)
pub const NULL_INDEX: u32 = u32::MAX;

/// Linkage of one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Link {
    pub next: u32,
    pub prev: u32,
}

impl Link {
    /// A link that belongs to no list.
    pub const UNLINKED: Link = Link {
        next: NULL_INDEX,
        prev: NULL_INDEX,
    };
}

impl Default for Link {
    fn default() -> Self {
        Link::UNLINKED
    }
}

/// Storage of per-node links addressed by index.
pub trait LinkStore {
    fn link(&self, index: u32) -> &Link;
    fn link_mut(&mut self, index: u32) -> &mut Link;
}

impl LinkStore for Vec<Link> {
    #[inline]
    fn link(&self, index: u32) -> &Link {
        &self[index as usize]
    }

    #[inline]
    fn link_mut(&mut self, index: u32) -> &mut Link {
        &mut self[index as usize]
    }
}

/// Head/tail/count of one list. The nodes themselves live in a `LinkStore`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexList {
    /// Oldest node (first to be popped from the front)
    head: u32,
    /// Newest node
    tail: u32,
    count: u32,
}

impl Default for IndexList {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexList {
    pub const fn new() -> Self {
        Self {
            head: NULL_INDEX,
            tail: NULL_INDEX,
            count: 0,
        }
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub const fn len(&self) -> u32 {
        self.count
    }

    #[inline]
    pub fn head(&self) -> Option<u32> {
        (self.head != NULL_INDEX).then_some(self.head)
    }

    #[inline]
    pub fn tail(&self) -> Option<u32> {
        (self.tail != NULL_INDEX).then_some(self.tail)
    }

    /// Append a node at the tail.
    #[inline]
    pub fn push_back<S: LinkStore + ?Sized>(&mut self, store: &mut S, index: u32) {
        if self.tail == NULL_INDEX {
            debug_assert!(self.head == NULL_INDEX);
            self.head = index;
            self.tail = index;
            *store.link_mut(index) = Link::UNLINKED;
        } else {
            store.link_mut(self.tail).next = index;
            *store.link_mut(index) = Link {
                next: NULL_INDEX,
                prev: self.tail,
            };
            self.tail = index;
        }
        self.count += 1;
    }

    /// Insert a node at the head.
    #[inline]
    pub fn push_front<S: LinkStore + ?Sized>(&mut self, store: &mut S, index: u32) {
        if self.head == NULL_INDEX {
            debug_assert!(self.tail == NULL_INDEX);
            self.head = index;
            self.tail = index;
            *store.link_mut(index) = Link::UNLINKED;
        } else {
            store.link_mut(self.head).prev = index;
            *store.link_mut(index) = Link {
                next: self.head,
                prev: NULL_INDEX,
            };
            self.head = index;
        }
        self.count += 1;
    }

    /// Remove and return the head node.
    #[inline]
    pub fn pop_front<S: LinkStore + ?Sized>(&mut self, store: &mut S) -> Option<u32> {
        let index = self.head()?;
        self.remove(store, index);
        Some(index)
    }

    /// Remove and return the tail node.
    #[inline]
    pub fn pop_back<S: LinkStore + ?Sized>(&mut self, store: &mut S) -> Option<u32> {
        let index = self.tail()?;
        self.remove(store, index);
        Some(index)
    }

    /// Unlink a node from anywhere in the list.
    ///
    /// Returns `true` if the list is now empty. The caller must guarantee the
    /// node is currently a member of this list.
    #[inline]
    pub fn remove<S: LinkStore + ?Sized>(&mut self, store: &mut S, index: u32) -> bool {
        let Link { next, prev } = *store.link(index);

        if prev == NULL_INDEX {
            debug_assert!(self.head == index);
            self.head = next;
        } else {
            store.link_mut(prev).next = next;
        }

        if next == NULL_INDEX {
            debug_assert!(self.tail == index);
            self.tail = prev;
        } else {
            store.link_mut(next).prev = prev;
        }

        debug_assert!(self.count > 0);
        self.count -= 1;
        *store.link_mut(index) = Link::UNLINKED;

        self.count == 0
    }

    /// Iterate node indices from head to tail.
    pub fn iter<'a, S: LinkStore + ?Sized>(&self, store: &'a S) -> Iter<'a, S> {
        Iter {
            store,
            cursor: self.head,
        }
    }

    /// First node (from the head) satisfying `pred`.
    pub fn find<S, F>(&self, store: &S, mut pred: F) -> Option<u32>
    where
        S: LinkStore + ?Sized,
        F: FnMut(u32) -> bool,
    {
        self.iter(store).find(|&index| pred(index))
    }
}

/// Head-to-tail iterator over an [`IndexList`].
pub struct Iter<'a, S: ?Sized> {
    store: &'a S,
    cursor: u32,
}

impl<S: LinkStore + ?Sized> Iterator for Iter<'_, S> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.cursor == NULL_INDEX {
            return None;
        }
        let index = self.cursor;
        self.cursor = self.store.link(index).next;
        Some(index)
    }
}
