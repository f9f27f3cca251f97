//! Operation entries - the per-operation state tracked by the matching engine.

use bitflags::bitflags;

use crate::arena::EntryId;
use crate::completion::CompletionEntry;
use crate::index_list::IndexList;
use crate::msg::{iov_total, Flags, IoVecs, MemDescs, PeerAddr};
use crate::protocol::PacketType;
use crate::transport::PacketId;

/// Message vs tagged operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OpKind {
    #[default]
    Msg,
    Tagged,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Direction {
    Tx,
    #[default]
    Rx,
}

/// Lifecycle state.
///
/// ```text
/// Free -> Posted ------------> Matched -> (completed, released)
///      -> Unexpected -> Claimed -^
///      -> MultiRecvPosted (until exhausted and every consumer finished)
///      -> Sending (tx)
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EntryState {
    #[default]
    Free,
    Posted,
    Unexpected,
    Matched,
    MultiRecvPosted,
    Claimed,
    Cancelled,
    Sending,
}

bitflags! {
    /// Engine-internal receive flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RxFlags: u8 {
        /// Entry is a posted multi-receive buffer.
        const MULTI_RECV_POSTED = 1 << 0;
        /// Entry consumes part of a multi-receive buffer.
        const MULTI_RECV_CONSUMER = 1 << 1;
        /// Receive was cancelled while a transfer was in flight.
        const RECV_CANCEL = 1 << 2;
    }
}

/// One in-flight send or receive.
#[derive(Clone, Debug, Default)]
pub struct OpEntry {
    /// Handle of this entry in its pool
    pub id: EntryId,
    pub kind: OpKind,
    pub dir: Direction,
    pub state: EntryState,
    pub rxr_flags: RxFlags,
    /// Flags the operation was posted with
    pub fi_flags: Flags,

    /// Destination (tx), source filter or actual source (rx)
    pub peer: Option<PeerAddr>,
    pub tag: u64,
    pub ignore: u64,

    pub iov: IoVecs,
    pub desc: MemDescs,
    /// Length of the message (tx: sum of iov; rx: sender's length)
    pub total_len: usize,
    /// Per-peer message id (tx) or the id carried by the packet (rx)
    pub msg_id: u64,

    /// Completion written when the operation finishes
    pub cq_entry: CompletionEntry,

    /// Protocol chosen for a send, or the type of the packet that arrived
    pub pkt_type: Option<PacketType>,
    /// Packet held by an unexpected or matched receive
    pub packet: Option<PacketId>,

    /// Owning multi-recv buffer of a consumer
    pub master: Option<EntryId>,
    /// Consumers of a multi-recv buffer still in flight
    pub consumers: IndexList,
}

impl OpEntry {
    /// Bytes available in the posted buffers.
    #[inline]
    pub fn capacity(&self) -> usize {
        iov_total(&self.iov)
    }

    #[inline]
    pub fn is_tagged(&self) -> bool {
        self.kind == OpKind::Tagged
    }

    #[inline]
    pub fn is_multi_recv_master(&self) -> bool {
        self.rxr_flags.contains(RxFlags::MULTI_RECV_POSTED)
    }

    #[inline]
    pub fn is_multi_recv_consumer(&self) -> bool {
        self.rxr_flags.contains(RxFlags::MULTI_RECV_CONSUMER)
    }

    /// Reset everything but the handle.
    #[inline]
    pub fn reset(&mut self) {
        let id = self.id;
        *self = OpEntry {
            id,
            ..OpEntry::default()
        };
    }
}
