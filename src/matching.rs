//! Matching Engine - send posting, receive matching and unexpected-message
//! handling.
//!
//! Implements the post/arrive algorithm:
//! 1. POSTING: a receive first searches the unexpected registry; on a miss
//!    it rests on the posted list of its kind.
//! 2. ARRIVAL: an incoming message first searches the posted list; on a
//!    miss it rests in the unexpected registry.
//!
//! Everything here runs under the endpoint lock. Receives that found their
//! message are appended to an output vector of [`MatchedRecv`]; the caller
//! starts those transfers after releasing the lock.

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::arena::{ClaimTicket, EntryArena, EntryId};
use crate::completion::{CompletionEntry, ErrorEntry};
use crate::config::EndpointConfig;
use crate::cq::{CompletionQueue, CqLock};
use crate::entry::{Direction, EntryState, OpEntry, OpKind, RxFlags};
use crate::error::{Error, Result};
use crate::index_list::IndexList;
use crate::msg::{
    consume_iov, iov_prefix, iov_total, tag_matches, Flags, IoVecs, MemDescs, PeerAddr,
};
use crate::protocol::{select_rtm, PacketType, SelectParams, SendShape};
use crate::transport::{IncomingRtm, MatchedRecv, Transport};
use crate::unexpected::UnexpectedQueue;

/// A send, as handed to the engine by the endpoint.
#[derive(Clone, Debug)]
pub struct SendRequest {
    pub iov: IoVecs,
    pub desc: MemDescs,
    pub addr: PeerAddr,
    pub context: u64,
    pub data: u64,
    /// `Some` for tagged sends
    pub tag: Option<u64>,
    pub flags: Flags,
}

/// A receive, as handed to the engine by the endpoint.
#[derive(Clone, Debug)]
pub struct RecvRequest {
    pub kind: OpKind,
    pub iov: IoVecs,
    pub desc: MemDescs,
    pub addr: Option<PeerAddr>,
    pub context: u64,
    pub tag: u64,
    pub ignore: u64,
    pub flags: Flags,
    pub claim: Option<ClaimTicket>,
}

/// Outcome of an incoming message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arrival {
    /// Matched a posted receive; the entry is now `Matched`.
    Matched(EntryId),
    /// No receive was waiting; the entry is now `Unexpected`.
    Unexpected(EntryId),
}

impl Arrival {
    #[inline]
    pub fn id(self) -> EntryId {
        match self {
            Arrival::Matched(id) | Arrival::Unexpected(id) => id,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct PeerState {
    next_msg_id: u64,
}

/// Lock-protected state of one endpoint.
pub struct MatchState {
    config: EndpointConfig,
    tx_pool: EntryArena,
    rx_pool: EntryArena,
    posted_msg: IndexList,
    posted_tagged: IndexList,
    unexp_msg: UnexpectedQueue,
    unexp_tagged: UnexpectedQueue,
    peers: FxHashMap<PeerAddr, PeerState>,
}

impl MatchState {
    /// Build the pools. `config` must already be validated.
    pub fn new(config: &EndpointConfig) -> Self {
        Self {
            config: config.clone(),
            tx_pool: EntryArena::new(config.tx_capacity),
            rx_pool: EntryArena::new(config.rx_capacity),
            posted_msg: IndexList::new(),
            posted_tagged: IndexList::new(),
            unexp_msg: UnexpectedQueue::new(),
            unexp_tagged: UnexpectedQueue::new(),
            peers: FxHashMap::default(),
        }
    }

    #[inline]
    fn peer_filter(&self, addr: Option<PeerAddr>) -> Option<PeerAddr> {
        if self.config.directed_recv {
            addr
        } else {
            None
        }
    }

    fn select_params(&self) -> SelectParams {
        SelectParams {
            mtu_size: self.config.mtu_size,
            min_read_msg_size: self.config.min_read_msg_size,
            max_medium_msg_size: self.config.max_medium_msg_size,
            rdma_read: self.config.rdma_read,
            mr_cache: self.config.mr_cache,
        }
    }

    // ========================================================================
    // Send Path
    // ========================================================================

    /// Allocate a tx entry, stamp the peer's next message id, select the
    /// protocol and post it.
    ///
    /// On a post failure the entry is released and the message id rolled
    /// back before the error is returned.
    pub fn post_send<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        req: SendRequest,
    ) -> Result<EntryId> {
        if transport.peer_in_backoff(req.addr) {
            trace!(peer = req.addr, "peer in backoff");
            return Err(Error::Retry);
        }

        let Some(id) = self.tx_pool.alloc() else {
            debug!("tx entry pool exhausted");
            return Err(Error::ResourceExhausted);
        };

        let total_len = iov_total(&req.iov);
        let tagged = req.tag.is_some();
        let shape = SendShape {
            total_len,
            tagged,
            delivery_complete: req.flags.contains(Flags::DELIVERY_COMPLETE),
            inject: req.flags.contains(Flags::INJECT),
            cq_data: req.flags.contains(Flags::REMOTE_CQ_DATA),
            desc_present: !req.desc.is_empty(),
        };
        let pkt_type = select_rtm(&shape, &self.select_params());

        let peer_state = self.peers.entry(req.addr).or_default();
        let msg_id = peer_state.next_msg_id;
        peer_state.next_msg_id += 1;

        let mut cq_flags = Flags::SEND | Flags::MSG;
        if tagged {
            cq_flags |= Flags::TAGGED;
        }

        let entry = self.tx_pool.get_mut(id).ok_or(Error::InvalidArgument)?;
        entry.kind = if tagged { OpKind::Tagged } else { OpKind::Msg };
        entry.dir = Direction::Tx;
        entry.state = EntryState::Sending;
        entry.fi_flags = req.flags;
        entry.peer = Some(req.addr);
        entry.tag = req.tag.unwrap_or(0);
        entry.total_len = total_len;
        entry.msg_id = msg_id;
        entry.pkt_type = Some(pkt_type);
        entry.cq_entry = CompletionEntry {
            context: req.context,
            flags: cq_flags,
            len: total_len,
            buf: req.iov.first().map(|v| v.addr),
            data: req.data,
            tag: entry.tag,
        };
        entry.iov = req.iov;
        entry.desc = req.desc;

        trace!(
            total_len,
            tag = entry.tag,
            msg_id,
            ?pkt_type,
            flags = ?req.flags,
            "posting send"
        );

        if let Err(err) = post_rtm(transport, entry, pkt_type) {
            debug!(%err, ?pkt_type, peer = req.addr, "rtm post failed");
            self.tx_pool.free(id);
            if let Some(peer_state) = self.peers.get_mut(&req.addr) {
                peer_state.next_msg_id -= 1;
            }
            return Err(err);
        }

        Ok(id)
    }

    /// Finish a send: write its completion (or error) and release the entry.
    pub fn complete_send<R: CqLock>(
        &mut self,
        tx_cq: &CompletionQueue<R>,
        id: EntryId,
        status: Result<()>,
    ) -> Result<()> {
        let entry = self.tx_pool.get(id).ok_or(Error::InvalidArgument)?;
        let template = entry.cq_entry;
        let flags = entry.fi_flags;

        let written = match status {
            Err(err) => tx_cq.write_error(ErrorEntry::from_template(&template, err)),
            Ok(()) if self.send_completes(flags) => tx_cq.write(&template),
            Ok(()) => Ok(()),
        };

        self.tx_pool.free(id);
        written
    }

    #[inline]
    fn send_completes(&self, flags: Flags) -> bool {
        !flags.contains(Flags::INJECT)
            && (!self.config.selective_completion || flags.contains(Flags::COMPLETION))
    }

    // ========================================================================
    // Receive Path
    // ========================================================================

    /// Post a receive: consume a matching unexpected message or rest on the
    /// posted list.
    pub fn post_recv(&mut self, req: RecvRequest, out: &mut Vec<MatchedRecv>) -> Result<()> {
        if req.flags.contains(Flags::MULTI_RECV) {
            if req.kind == OpKind::Tagged {
                warn!("multi-recv is not supported for tagged receives");
                return Err(Error::InvalidArgument);
            }
            return self.post_multi_recv(req, out);
        }

        let filter = self.peer_filter(req.addr);

        if let Some(id) = self.find_unexpected(req.kind, filter, req.tag, req.ignore) {
            self.unexpected_mut(req.kind).remove(id);
            debug!(?id, kind = ?req.kind, "receive matched unexpected message");

            if let Some(entry) = self.rx_pool.get_mut(id) {
                entry.iov = req.iov;
                entry.desc = req.desc;
                entry.fi_flags = req.flags;
                entry.ignore = req.ignore;
                entry.cq_entry.context = req.context;
            }
            out.extend(self.match_complete(id));
            return Ok(());
        }

        let Some(id) = self.rx_pool.alloc() else {
            debug!("rx entry pool exhausted");
            return Err(Error::ResourceExhausted);
        };

        if let Some(entry) = self.rx_pool.get_mut(id) {
            entry.kind = req.kind;
            entry.dir = Direction::Rx;
            entry.state = EntryState::Posted;
            entry.fi_flags = req.flags;
            entry.peer = filter;
            entry.tag = req.tag;
            entry.ignore = req.ignore;
            entry.total_len = iov_total(&req.iov);
            entry.iov = req.iov;
            entry.desc = req.desc;
            entry.cq_entry.context = req.context;
        }
        self.posted_push(req.kind, id.index());
        Ok(())
    }

    /// Post a multi-buffer receive, draining matching unexpected messages
    /// into consumers first.
    fn post_multi_recv(&mut self, req: RecvRequest, out: &mut Vec<MatchedRecv>) -> Result<()> {
        let total = iov_total(&req.iov);
        if total < self.config.min_multi_recv_size {
            warn!(
                total,
                min = self.config.min_multi_recv_size,
                "multi-recv buffer smaller than the minimum"
            );
            return Err(Error::InvalidArgument);
        }

        let Some(master) = self.rx_pool.alloc() else {
            debug!("rx entry pool exhausted");
            return Err(Error::ResourceExhausted);
        };
        let filter = self.peer_filter(req.addr);

        if let Some(entry) = self.rx_pool.get_mut(master) {
            entry.kind = OpKind::Msg;
            entry.dir = Direction::Rx;
            entry.state = EntryState::MultiRecvPosted;
            entry.rxr_flags = RxFlags::MULTI_RECV_POSTED;
            entry.fi_flags = req.flags;
            entry.peer = filter;
            entry.total_len = total;
            entry.iov = req.iov;
            entry.desc = req.desc;
            entry.cq_entry.context = req.context;
        }

        while self.buffer_available(master) {
            let Some(unexp) = self.unexp_msg.front(filter) else {
                break;
            };
            self.unexp_msg.remove(unexp);
            out.push(self.split_consumer(master, unexp)?);
        }

        if self.buffer_available(master) {
            self.posted_msg.push_back(&mut self.rx_pool, master.index());
        } else if self
            .rx_pool
            .get(master)
            .is_some_and(|m| m.consumers.is_empty())
        {
            self.rx_pool.free(master);
        }
        Ok(())
    }

    /// A multi-recv buffer stays posted while at least `min_multi_recv_size`
    /// bytes remain.
    #[inline]
    fn buffer_available(&self, master: EntryId) -> bool {
        self.rx_pool
            .get(master)
            .is_some_and(|m| m.capacity() >= self.config.min_multi_recv_size)
    }

    /// Turn `consumer` (holding an arrived message) into a consumer of
    /// `master`, carving its bytes off the front of the master's buffer.
    fn split_consumer(&mut self, master: EntryId, consumer: EntryId) -> Result<MatchedRecv> {
        let (master_iov, context) = {
            let m = self.rx_pool.get(master).ok_or(Error::InvalidArgument)?;
            (m.iov.clone(), m.cq_entry.context)
        };

        let consumed = {
            let c = self.rx_pool.get_mut(consumer).ok_or(Error::InvalidArgument)?;
            let consumed = iov_total(&master_iov).min(c.total_len);
            c.kind = OpKind::Msg;
            c.iov = iov_prefix(&master_iov, consumed);
            c.cq_entry.context = context;
            c.rxr_flags |= RxFlags::MULTI_RECV_CONSUMER;
            c.fi_flags |= Flags::MULTI_RECV;
            c.master = Some(master);
            consumed
        };

        let mut consumers = {
            let m = self.rx_pool.get_mut(master).ok_or(Error::InvalidArgument)?;
            consume_iov(&mut m.iov, consumed);
            m.consumers
        };
        consumers.push_back(&mut self.rx_pool, consumer.index());
        if let Some(m) = self.rx_pool.get_mut(master) {
            m.consumers = consumers;
        }

        debug!(?master, ?consumer, consumed, "split multi-recv consumer");
        self.match_complete(consumer).ok_or(Error::InvalidArgument)
    }

    /// Drop a finished consumer from its master. Returns `true` if that
    /// retired the master.
    fn release_consumer(&mut self, master: EntryId, consumer: EntryId) -> bool {
        let Some(mut consumers) = self.rx_pool.get(master).map(|m| m.consumers) else {
            return false;
        };
        consumers.remove(&mut self.rx_pool, consumer.index());

        let min = self.config.min_multi_recv_size;
        let done = match self.rx_pool.get_mut(master) {
            Some(m) => {
                m.consumers = consumers;
                consumers.is_empty()
                    && (m.capacity() < min || m.rxr_flags.contains(RxFlags::RECV_CANCEL))
            }
            None => false,
        };

        if done {
            trace!(?master, "multi-recv buffer released");
            self.rx_pool.free(master);
        }
        done
    }

    fn find_unexpected(
        &self,
        kind: OpKind,
        filter: Option<PeerAddr>,
        tag: u64,
        ignore: u64,
    ) -> Option<EntryId> {
        match kind {
            OpKind::Msg => self.unexp_msg.front(filter),
            OpKind::Tagged => {
                let pool = &self.rx_pool;
                self.unexp_tagged.find(filter, |id| {
                    pool.get(id).is_some_and(|e| tag_matches(tag, ignore, e.tag))
                })
            }
        }
    }

    /// First posted entry of `kind` accepting a message from `peer` with
    /// `tag`, as a raw list index.
    fn find_posted(&self, kind: OpKind, peer: PeerAddr, tag: u64) -> Option<u32> {
        let list = match kind {
            OpKind::Msg => &self.posted_msg,
            OpKind::Tagged => &self.posted_tagged,
        };
        let pool = &self.rx_pool;
        list.find(pool, |index| {
            let e = pool.at(index);
            e.peer.map_or(true, |p| p == peer)
                && (kind == OpKind::Msg || tag_matches(e.tag, e.ignore, tag))
        })
    }

    #[inline]
    fn unexpected_mut(&mut self, kind: OpKind) -> &mut UnexpectedQueue {
        match kind {
            OpKind::Msg => &mut self.unexp_msg,
            OpKind::Tagged => &mut self.unexp_tagged,
        }
    }

    #[inline]
    fn posted_push(&mut self, kind: OpKind, index: u32) {
        match kind {
            OpKind::Msg => self.posted_msg.push_back(&mut self.rx_pool, index),
            OpKind::Tagged => self.posted_tagged.push_back(&mut self.rx_pool, index),
        }
    }

    #[inline]
    fn posted_remove(&mut self, kind: OpKind, index: u32) {
        match kind {
            OpKind::Msg => self.posted_msg.remove(&mut self.rx_pool, index),
            OpKind::Tagged => self.posted_tagged.remove(&mut self.rx_pool, index),
        };
    }

    /// Mark `id` matched, fill its completion template and describe the
    /// transfer to start.
    fn match_complete(&mut self, id: EntryId) -> Option<MatchedRecv> {
        let entry = self.rx_pool.get_mut(id)?;
        entry.state = EntryState::Matched;
        let len = apply_match_template(entry);

        Some(MatchedRecv {
            id,
            packet: entry.packet,
            peer: entry.peer,
            iov: entry.iov.clone(),
            len,
            total_len: entry.total_len,
        })
    }

    // ========================================================================
    // Arrival Path
    // ========================================================================

    /// Handle an incoming request-to-message packet.
    ///
    /// # Errors
    /// `ResourceExhausted` if no rx entry is free; the packet is not retained.
    pub fn on_incoming(&mut self, rtm: &IncomingRtm, out: &mut Vec<MatchedRecv>) -> Result<Arrival> {
        let kind = if rtm.pkt_type.is_tagged() {
            OpKind::Tagged
        } else {
            OpKind::Msg
        };

        if let Some(index) = self.find_posted(kind, rtm.peer, rtm.tag) {
            let posted = self.rx_pool.at(index);
            let posted_id = posted.id;

            if posted.is_multi_recv_master() {
                let Some(consumer) = self.rx_pool.alloc() else {
                    debug!("rx entry pool exhausted");
                    return Err(Error::ResourceExhausted);
                };
                self.fill_from_rtm(consumer, rtm, kind);
                out.push(self.split_consumer(posted_id, consumer)?);
                if !self.buffer_available(posted_id) {
                    self.posted_remove(OpKind::Msg, index);
                }
                return Ok(Arrival::Matched(consumer));
            }

            self.posted_remove(kind, index);
            self.fill_from_rtm(posted_id, rtm, kind);
            out.extend(self.match_complete(posted_id));
            return Ok(Arrival::Matched(posted_id));
        }

        let Some(id) = self.rx_pool.alloc() else {
            warn!(peer = rtm.peer, "rx entry pool exhausted, unexpected message not queued");
            return Err(Error::ResourceExhausted);
        };
        self.fill_from_rtm(id, rtm, kind);
        if let Some(entry) = self.rx_pool.get_mut(id) {
            entry.state = EntryState::Unexpected;
        }
        self.unexpected_mut(kind).insert(id, rtm.peer);
        trace!(?id, peer = rtm.peer, tag = rtm.tag, "queued unexpected message");

        Ok(Arrival::Unexpected(id))
    }

    fn fill_from_rtm(&mut self, id: EntryId, rtm: &IncomingRtm, kind: OpKind) {
        let Some(entry) = self.rx_pool.get_mut(id) else {
            return;
        };
        entry.kind = kind;
        entry.dir = Direction::Rx;
        entry.peer = Some(rtm.peer);
        if kind == OpKind::Tagged {
            entry.tag = rtm.tag;
        }
        entry.total_len = rtm.msg_len;
        entry.msg_id = rtm.msg_id;
        entry.packet = Some(rtm.packet);
        entry.pkt_type = Some(rtm.pkt_type);
        if let Some(data) = rtm.data {
            entry.cq_entry.data = data;
            entry.cq_entry.flags |= Flags::REMOTE_CQ_DATA;
        }
    }

    // ========================================================================
    // Completion Path
    // ========================================================================

    /// Finish a matched receive: run the multi-recv hook, write the
    /// completion (success, truncation or error), release packet and entry.
    pub fn complete_recv<T: Transport + ?Sized, R: CqLock>(
        &mut self,
        transport: &T,
        rx_cq: &CompletionQueue<R>,
        id: EntryId,
        status: Result<()>,
    ) -> Result<()> {
        let entry = self.rx_pool.get(id).ok_or(Error::InvalidArgument)?;
        if entry.state != EntryState::Matched {
            return Err(Error::InvalidArgument);
        }

        let mut template = entry.cq_entry;
        let total_len = entry.total_len;
        let packet = entry.packet;
        let src = entry.peer.filter(|_| self.config.source);
        let master = entry.master.filter(|_| entry.is_multi_recv_consumer());

        if let Some(master) = master {
            if self.release_consumer(master, id) {
                template.flags |= Flags::MULTI_RECV;
            }
        }

        let written = match status {
            Err(err) => rx_cq.write_error(ErrorEntry::from_template(&template, err)),
            Ok(()) if total_len > template.len => {
                debug!(?id, total_len, len = template.len, "receive truncated");
                rx_cq.write_error_trunc(&template, total_len - template.len)
            }
            Ok(()) => match src {
                Some(src) => rx_cq.write_src(&template, src),
                None => rx_cq.write(&template),
            },
        };

        if let Some(packet) = packet {
            transport.release_packet(packet);
        }
        self.rx_pool.free(id);
        written
    }

    // ========================================================================
    // Peek / Claim / Discard
    // ========================================================================

    /// Look for a tagged unexpected message without receiving it.
    ///
    /// Writes a completion describing the match, or a `NoMessage` error
    /// completion. With `CLAIM` the message is reserved and a ticket
    /// returned; with `DISCARD` it is dropped.
    pub fn peek<T: Transport + ?Sized, R: CqLock>(
        &mut self,
        transport: &T,
        rx_cq: &CompletionQueue<R>,
        req: &RecvRequest,
        flags: Flags,
    ) -> Result<Option<ClaimTicket>> {
        let filter = self.peer_filter(req.addr);
        let Some(id) = self.find_unexpected(OpKind::Tagged, filter, req.tag, req.ignore) else {
            trace!(tag = req.tag, "peek found no message");
            rx_cq.write_error_peek(req.context, Flags::TAGGED | Flags::RECV, req.tag)?;
            return Ok(None);
        };

        if flags.contains(Flags::DISCARD) {
            self.unexp_tagged.remove(id);
            self.discard(transport, rx_cq, id, req.context)?;
            return Ok(None);
        }

        let entry = self.rx_pool.get(id).ok_or(Error::InvalidArgument)?;
        let completion = CompletionEntry {
            context: req.context,
            flags: Flags::TAGGED | Flags::RECV | (entry.cq_entry.flags & Flags::REMOTE_CQ_DATA),
            len: entry.total_len,
            buf: None,
            data: entry.cq_entry.data,
            tag: entry.tag,
        };
        let src = entry.peer.filter(|_| self.config.source);

        // A failed write leaves the message unexpected and unclaimed
        match src {
            Some(src) => rx_cq.write_src(&completion, src)?,
            None => rx_cq.write(&completion)?,
        }

        if !flags.contains(Flags::CLAIM) {
            return Ok(None);
        }
        self.unexp_tagged.remove(id);
        if let Some(entry) = self.rx_pool.get_mut(id) {
            entry.state = EntryState::Claimed;
        }
        debug!(?id, "claimed unexpected message");
        Ok(Some(ClaimTicket::new(id)))
    }

    /// Receive (or with `DISCARD`, drop) a message reserved by a peek.
    pub fn claim<T: Transport + ?Sized, R: CqLock>(
        &mut self,
        transport: &T,
        rx_cq: &CompletionQueue<R>,
        req: RecvRequest,
        flags: Flags,
        out: &mut Vec<MatchedRecv>,
    ) -> Result<()> {
        let id = req.claim.ok_or(Error::InvalidArgument)?.entry();
        match self.rx_pool.get(id) {
            Some(entry) if entry.state == EntryState::Claimed => {}
            _ => {
                warn!(?id, "claim with a stale ticket");
                return Err(Error::InvalidArgument);
            }
        }

        if flags.contains(Flags::DISCARD) {
            return self.discard(transport, rx_cq, id, req.context);
        }

        if let Some(entry) = self.rx_pool.get_mut(id) {
            entry.iov = req.iov;
            entry.desc = req.desc;
            entry.fi_flags = req.flags;
            entry.cq_entry.context = req.context;
        }
        out.extend(self.match_complete(id));
        Ok(())
    }

    /// Drop an unexpected message, reporting a zero-length completion.
    fn discard<T: Transport + ?Sized, R: CqLock>(
        &mut self,
        transport: &T,
        rx_cq: &CompletionQueue<R>,
        id: EntryId,
        context: u64,
    ) -> Result<()> {
        let entry = self.rx_pool.get_mut(id).ok_or(Error::InvalidArgument)?;
        entry.state = EntryState::Cancelled;
        entry.iov.clear();
        entry.cq_entry.context = context;
        apply_match_template(entry);

        let template = entry.cq_entry;
        let packet = entry.packet;

        let written = rx_cq.write(&template);
        if let Some(packet) = packet {
            transport.release_packet(packet);
        }
        self.rx_pool.free(id);
        debug!(?id, "discarded unexpected message");
        written
    }

    // ========================================================================
    // Cancel
    // ========================================================================

    /// Cancel the posted receive with `context`. Returns `false` if no
    /// posted receive carries it.
    ///
    /// A multi-recv buffer with consumers in flight is unposted at once but
    /// released when its last consumer completes.
    pub fn cancel<R: CqLock>(
        &mut self,
        rx_cq: &CompletionQueue<R>,
        context: u64,
    ) -> Result<bool> {
        for kind in [OpKind::Msg, OpKind::Tagged] {
            let list = match kind {
                OpKind::Msg => &self.posted_msg,
                OpKind::Tagged => &self.posted_tagged,
            };
            let pool = &self.rx_pool;
            let Some(index) = list.find(pool, |i| pool.at(i).cq_entry.context == context) else {
                continue;
            };

            self.posted_remove(kind, index);
            let entry = self.rx_pool.at_mut(index);
            let id = entry.id;

            let mut template = entry.cq_entry;
            template.flags |= Flags::RECV | Flags::MSG;
            if entry.is_tagged() {
                template.flags |= Flags::TAGGED;
                template.tag = entry.tag;
            }
            template.len = 0;

            let keep = entry.is_multi_recv_master() && !entry.consumers.is_empty();
            if entry.is_multi_recv_master() {
                template.flags |= Flags::MULTI_RECV;
            }
            if keep {
                entry.rxr_flags |= RxFlags::RECV_CANCEL;
            } else {
                entry.state = EntryState::Cancelled;
            }

            let written = rx_cq.write_error(ErrorEntry::from_template(&template, Error::Cancelled));
            if !keep {
                self.rx_pool.free(id);
            }
            debug!(?id, context, "cancelled posted receive");
            return written.map(|()| true);
        }
        Ok(false)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    #[inline]
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Receives of `kind` resting on the posted list.
    pub fn posted_len(&self, kind: OpKind) -> u32 {
        match kind {
            OpKind::Msg => self.posted_msg.len(),
            OpKind::Tagged => self.posted_tagged.len(),
        }
    }

    /// Messages of `kind` waiting in the unexpected registry.
    pub fn unexpected_len(&self, kind: OpKind) -> usize {
        match kind {
            OpKind::Msg => self.unexp_msg.len(),
            OpKind::Tagged => self.unexp_tagged.len(),
        }
    }

    #[inline]
    pub fn tx_in_flight(&self) -> u32 {
        self.tx_pool.allocated()
    }

    #[inline]
    pub fn rx_in_flight(&self) -> u32 {
        self.rx_pool.allocated()
    }

    /// Message id the next send to `peer` will carry.
    pub fn next_msg_id(&self, peer: PeerAddr) -> u64 {
        self.peers.get(&peer).map_or(0, |p| p.next_msg_id)
    }

    pub fn rx_entry(&self, id: EntryId) -> Option<&OpEntry> {
        self.rx_pool.get(id)
    }

    pub fn tx_entry(&self, id: EntryId) -> Option<&OpEntry> {
        self.tx_pool.get(id)
    }

    /// Compute a hash of the current state (for determinism testing)
    pub fn state_hash(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();

        for list in [&self.posted_msg, &self.posted_tagged] {
            for index in list.iter(&self.rx_pool) {
                let e = self.rx_pool.at(index);
                (e.cq_entry.context, e.tag, e.ignore, e.capacity()).hash(&mut hasher);
            }
        }

        for queue in [&self.unexp_msg, &self.unexp_tagged] {
            for id in queue.iter(None) {
                if let Some(e) = self.rx_pool.get(id) {
                    (e.peer, e.tag, e.msg_id, e.total_len).hash(&mut hasher);
                }
            }
        }

        let mut peers: Vec<_> = self
            .peers
            .iter()
            .map(|(addr, p)| (*addr, p.next_msg_id))
            .collect();
        peers.sort_unstable();
        peers.hash(&mut hasher);

        self.tx_pool.allocated().hash(&mut hasher);
        self.rx_pool.allocated().hash(&mut hasher);

        hasher.finish()
    }
}

/// Post the RTM packet of a send.
///
/// Baseline types go out directly. Types needing an extra feature require
/// the peer's handshake: without it one is triggered and the send must be
/// retried; with it the peer must advertise the type.
fn post_rtm<T: Transport + ?Sized>(
    transport: &T,
    entry: &OpEntry,
    pkt_type: PacketType,
) -> Result<()> {
    let peer = entry.peer.ok_or(Error::InvalidArgument)?;

    if !pkt_type.is_extra_feature() {
        return transport.post_packet(entry, pkt_type, entry.fi_flags);
    }

    if !transport.handshake_received(peer) {
        transport.trigger_handshake(peer)?;
        return Err(Error::Retry);
    }

    if !transport.peer_supports(pkt_type, peer) {
        return Err(Error::Unsupported);
    }

    transport.post_packet(entry, pkt_type, entry.fi_flags)
}

/// Fill the receive completion template of a matched entry. Returns the
/// delivered length.
fn apply_match_template(entry: &mut OpEntry) -> usize {
    let len = entry.total_len.min(entry.capacity());
    entry.cq_entry.len = len;
    entry.cq_entry.buf = entry.iov.first().map(|v| v.addr);
    entry.cq_entry.flags |= Flags::RECV | Flags::MSG;
    if entry.is_tagged() {
        entry.cq_entry.flags |= Flags::TAGGED;
        entry.cq_entry.tag = entry.tag;
    }
    len
}
