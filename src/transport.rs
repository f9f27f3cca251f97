//! Transport seam - everything the matching engine needs from the packet
//! layer underneath it.
//!
//! The engine calls `post_packet`, `trigger_handshake`, `handshake_received`,
//! `peer_supports`, `peer_in_backoff` and `release_packet` with the endpoint
//! lock held; implementations must not call back into the endpoint from
//! those. `progress` and `start_receive_transfer` are always called with the
//! lock released and may re-enter the endpoint (deliver arrivals, complete
//! operations).

use std::sync::Arc;

use crate::arena::EntryId;
use crate::entry::OpEntry;
use crate::error::Result;
use crate::msg::{Flags, IoVecs, PeerAddr};
use crate::protocol::PacketType;

/// Opaque handle to a received packet buffer owned by the transport.
pub type PacketId = u64;

/// A request-to-message packet that arrived from a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IncomingRtm {
    pub packet: PacketId,
    pub pkt_type: PacketType,
    pub peer: PeerAddr,
    /// Ignored for untagged types
    pub tag: u64,
    /// Total message length announced by the sender
    pub msg_len: usize,
    /// Remote CQ data, if the sender attached any
    pub data: Option<u64>,
    pub msg_id: u64,
}

/// A receive that found its message. The transport moves the payload into
/// `iov` and later reports back through `Endpoint::complete_recv(id, ..)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchedRecv {
    pub id: EntryId,
    pub packet: Option<PacketId>,
    pub peer: Option<PeerAddr>,
    pub iov: IoVecs,
    /// Bytes that will be delivered: `min(total_len, capacity)`
    pub len: usize,
    pub total_len: usize,
}

/// Packet layer collaborator.
pub trait Transport: Send + Sync {
    /// Post the request packet(s) of a send.
    fn post_packet(&self, entry: &OpEntry, pkt_type: PacketType, flags: Flags) -> Result<()>;

    /// Start a handshake with `peer`.
    fn trigger_handshake(&self, peer: PeerAddr) -> Result<()>;

    /// Whether `peer`'s handshake (and so its feature set) has been seen.
    fn handshake_received(&self, peer: PeerAddr) -> bool;

    /// Whether `peer` advertised support for `pkt_type`.
    fn peer_supports(&self, pkt_type: PacketType, peer: PeerAddr) -> bool;

    /// Whether sends to `peer` are currently paused.
    fn peer_in_backoff(&self, peer: PeerAddr) -> bool;

    /// Drive outstanding work.
    fn progress(&self);

    /// Begin moving a matched message into the receive buffer.
    fn start_receive_transfer(&self, recv: &MatchedRecv) -> Result<()>;

    /// Return a received packet buffer.
    fn release_packet(&self, packet: PacketId);
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn post_packet(&self, entry: &OpEntry, pkt_type: PacketType, flags: Flags) -> Result<()> {
        (**self).post_packet(entry, pkt_type, flags)
    }

    fn trigger_handshake(&self, peer: PeerAddr) -> Result<()> {
        (**self).trigger_handshake(peer)
    }

    fn handshake_received(&self, peer: PeerAddr) -> bool {
        (**self).handshake_received(peer)
    }

    fn peer_supports(&self, pkt_type: PacketType, peer: PeerAddr) -> bool {
        (**self).peer_supports(pkt_type, peer)
    }

    fn peer_in_backoff(&self, peer: PeerAddr) -> bool {
        (**self).peer_in_backoff(peer)
    }

    fn progress(&self) {
        (**self).progress()
    }

    fn start_receive_transfer(&self, recv: &MatchedRecv) -> Result<()> {
        (**self).start_receive_transfer(recv)
    }

    fn release_packet(&self, packet: PacketId) {
        (**self).release_packet(packet)
    }
}
