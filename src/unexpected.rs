//! Unexpected Registry - messages that arrived before a matching receive.
//!
//! Every unexpected entry is registered twice: in the endpoint-wide queue and
//! in the queue of its source peer. Both are keyed by a shared arrival
//! sequence number, so either view walks entries in arrival order, and a
//! single [`UnexpectedQueue::remove`] drops the entry from both.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::arena::EntryId;
use crate::msg::PeerAddr;

/// Arrival-ordered registry of unexpected entries.
#[derive(Debug, Default)]
pub struct UnexpectedQueue {
    /// Endpoint-wide view: sequence -> entry
    by_seq: BTreeMap<u64, EntryId>,
    /// Per-peer views: peer -> (sequence -> entry)
    by_peer: FxHashMap<PeerAddr, BTreeMap<u64, EntryId>>,
    /// Reverse lookup for O(log n) removal from both views
    index: FxHashMap<EntryId, (u64, PeerAddr)>,
    next_seq: u64,
}

impl UnexpectedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id`, which arrived from `peer`, behind every earlier arrival.
    ///
    /// Returns `false` if `id` is already registered.
    pub fn insert(&mut self, id: EntryId, peer: PeerAddr) -> bool {
        if self.index.contains_key(&id) {
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        self.by_seq.insert(seq, id);
        self.by_peer.entry(peer).or_default().insert(seq, id);
        self.index.insert(id, (seq, peer));
        true
    }

    /// Remove `id` from both views. Returns `false` if it was not registered.
    pub fn remove(&mut self, id: EntryId) -> bool {
        let Some((seq, peer)) = self.index.remove(&id) else {
            return false;
        };

        self.by_seq.remove(&seq);
        if let Some(queue) = self.by_peer.get_mut(&peer) {
            queue.remove(&seq);
            if queue.is_empty() {
                self.by_peer.remove(&peer);
            }
        }
        true
    }

    #[inline]
    pub fn contains(&self, id: EntryId) -> bool {
        self.index.contains_key(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }

    /// Number of entries from `peer`.
    pub fn len_for(&self, peer: PeerAddr) -> usize {
        self.by_peer.get(&peer).map_or(0, BTreeMap::len)
    }

    /// Earliest arrival, optionally restricted to one peer.
    pub fn front(&self, peer: Option<PeerAddr>) -> Option<EntryId> {
        self.iter(peer).next()
    }

    /// Earliest arrival satisfying `pred`, optionally restricted to one peer.
    pub fn find<F>(&self, peer: Option<PeerAddr>, mut pred: F) -> Option<EntryId>
    where
        F: FnMut(EntryId) -> bool,
    {
        self.iter(peer).find(|&id| pred(id))
    }

    /// Entries in arrival order, optionally restricted to one peer.
    pub fn iter(&self, peer: Option<PeerAddr>) -> Box<dyn Iterator<Item = EntryId> + '_> {
        match peer {
            None => Box::new(self.by_seq.values().copied()),
            Some(peer) => match self.by_peer.get(&peer) {
                Some(queue) => Box::new(queue.values().copied()),
                None => Box::new(std::iter::empty()),
            },
        }
    }
}
