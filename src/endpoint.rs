//! Endpoint - the public send/receive surface.
//!
//! Wraps [`MatchState`] in one endpoint-wide lock. Every public method takes
//! the lock, runs the engine, drops the lock and only then runs the deferred
//! transport calls (`start_receive_transfer`, `progress`). A transport may
//! therefore call back into the endpoint from those hooks.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::arena::{ClaimTicket, EntryId};
use crate::config::EndpointConfig;
use crate::cq::{BindProgress, CompletionQueue, CqLock, Progress};
use crate::entry::{EntryState, OpEntry, OpKind};
use crate::error::{Error, Result};
use crate::matching::{Arrival, MatchState, RecvRequest, SendRequest};
use crate::msg::{
    bounded_desc, bounded_iov, iov_total, Flags, IoVec, IoVecs, MemDesc, MemDescs, Msg,
    PeerAddr, TaggedMsg,
};
use crate::transport::{IncomingRtm, MatchedRecv, Transport};

/// Reliable-datagram endpoint over a [`Transport`].
///
/// `R` is the lock of its completion queues. With
/// [`SingleThreadRawMutex`](crate::sync::SingleThreadRawMutex) the endpoint
/// is `!Send` and its completions skip real locking.
pub struct Endpoint<T: Transport, R: CqLock = parking_lot::RawMutex> {
    state: Mutex<MatchState>,
    transport: T,
    tx_cq: Arc<CompletionQueue<R>>,
    rx_cq: Arc<CompletionQueue<R>>,
    config: EndpointConfig,
}

fn single_iov(buf: IoVec) -> IoVecs {
    let mut iov = IoVecs::new();
    iov.push(buf);
    iov
}

fn single_desc(desc: Option<MemDesc>) -> MemDescs {
    desc.into_iter().collect()
}

impl<T, R> Endpoint<T, R>
where
    T: Transport + 'static,
    R: CqLock + 'static,
    CompletionQueue<R>: BindProgress<Endpoint<T, R>>,
{
    /// Create an endpoint and bind it to its completion queues.
    ///
    /// Reads that find a bound queue empty drive this endpoint's progress.
    pub fn new(
        config: EndpointConfig,
        transport: T,
        tx_cq: Arc<CompletionQueue<R>>,
        rx_cq: Arc<CompletionQueue<R>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let ep = Arc::new(Self {
            state: Mutex::new(MatchState::new(&config)),
            transport,
            tx_cq,
            rx_cq,
            config,
        });

        ep.tx_cq.bind_endpoint(Arc::downgrade(&ep));
        if !Arc::ptr_eq(&ep.tx_cq, &ep.rx_cq) {
            ep.rx_cq.bind_endpoint(Arc::downgrade(&ep));
        }

        debug!(
            tx_capacity = ep.config.tx_capacity,
            rx_capacity = ep.config.rx_capacity,
            "endpoint created"
        );
        Ok(ep)
    }
}

impl<T: Transport, R: CqLock> Endpoint<T, R> {
    // ========================================================================
    // Send Operations
    // ========================================================================

    pub fn send(
        &self,
        buf: IoVec,
        desc: Option<MemDesc>,
        dest: PeerAddr,
        context: u64,
    ) -> Result<EntryId> {
        self.submit_send(SendRequest {
            iov: single_iov(buf),
            desc: single_desc(desc),
            addr: dest,
            context,
            data: 0,
            tag: None,
            flags: Flags::COMPLETION,
        })
    }

    pub fn sendv(
        &self,
        iov: &[IoVec],
        desc: &[MemDesc],
        dest: PeerAddr,
        context: u64,
    ) -> Result<EntryId> {
        self.submit_send(SendRequest {
            iov: bounded_iov(iov, self.config.tx_iov_limit)?,
            desc: bounded_desc(desc, self.config.tx_iov_limit)?,
            addr: dest,
            context,
            data: 0,
            tag: None,
            flags: Flags::COMPLETION,
        })
    }

    /// Send described by `msg`; `msg.addr` is required.
    pub fn sendmsg(&self, msg: &Msg, flags: Flags) -> Result<EntryId> {
        let addr = msg.addr.ok_or(Error::InvalidArgument)?;
        self.check_inject(&msg.iov, flags)?;
        self.submit_send(SendRequest {
            iov: bounded_iov(&msg.iov, self.config.tx_iov_limit)?,
            desc: bounded_desc(&msg.desc, self.config.tx_iov_limit)?,
            addr,
            context: msg.context,
            data: msg.data,
            tag: None,
            flags,
        })
    }

    /// Send carrying remote CQ data.
    pub fn senddata(
        &self,
        buf: IoVec,
        desc: Option<MemDesc>,
        data: u64,
        dest: PeerAddr,
        context: u64,
    ) -> Result<EntryId> {
        self.submit_send(SendRequest {
            iov: single_iov(buf),
            desc: single_desc(desc),
            addr: dest,
            context,
            data,
            tag: None,
            flags: Flags::COMPLETION | Flags::REMOTE_CQ_DATA,
        })
    }

    /// Send of at most `inject_size` bytes; no completion is generated.
    pub fn inject(&self, buf: IoVec, dest: PeerAddr) -> Result<EntryId> {
        self.injectdata_inner(buf, None, dest, None)
    }

    pub fn injectdata(&self, buf: IoVec, data: u64, dest: PeerAddr) -> Result<EntryId> {
        self.injectdata_inner(buf, Some(data), dest, None)
    }

    pub fn tsend(
        &self,
        buf: IoVec,
        desc: Option<MemDesc>,
        dest: PeerAddr,
        tag: u64,
        context: u64,
    ) -> Result<EntryId> {
        self.submit_send(SendRequest {
            iov: single_iov(buf),
            desc: single_desc(desc),
            addr: dest,
            context,
            data: 0,
            tag: Some(tag),
            flags: Flags::COMPLETION,
        })
    }

    pub fn tsendv(
        &self,
        iov: &[IoVec],
        desc: &[MemDesc],
        dest: PeerAddr,
        tag: u64,
        context: u64,
    ) -> Result<EntryId> {
        self.submit_send(SendRequest {
            iov: bounded_iov(iov, self.config.tx_iov_limit)?,
            desc: bounded_desc(desc, self.config.tx_iov_limit)?,
            addr: dest,
            context,
            data: 0,
            tag: Some(tag),
            flags: Flags::COMPLETION,
        })
    }

    pub fn tsendmsg(&self, msg: &TaggedMsg, flags: Flags) -> Result<EntryId> {
        let addr = msg.addr.ok_or(Error::InvalidArgument)?;
        self.check_inject(&msg.iov, flags)?;
        self.submit_send(SendRequest {
            iov: bounded_iov(&msg.iov, self.config.tx_iov_limit)?,
            desc: bounded_desc(&msg.desc, self.config.tx_iov_limit)?,
            addr,
            context: msg.context,
            data: msg.data,
            tag: Some(msg.tag),
            flags,
        })
    }

    pub fn tsenddata(
        &self,
        buf: IoVec,
        desc: Option<MemDesc>,
        data: u64,
        dest: PeerAddr,
        tag: u64,
        context: u64,
    ) -> Result<EntryId> {
        self.submit_send(SendRequest {
            iov: single_iov(buf),
            desc: single_desc(desc),
            addr: dest,
            context,
            data,
            tag: Some(tag),
            flags: Flags::COMPLETION | Flags::REMOTE_CQ_DATA,
        })
    }

    pub fn tinject(&self, buf: IoVec, dest: PeerAddr, tag: u64) -> Result<EntryId> {
        self.injectdata_inner(buf, None, dest, Some(tag))
    }

    pub fn tinjectdata(&self, buf: IoVec, data: u64, dest: PeerAddr, tag: u64) -> Result<EntryId> {
        self.injectdata_inner(buf, Some(data), dest, Some(tag))
    }

    fn injectdata_inner(
        &self,
        buf: IoVec,
        data: Option<u64>,
        dest: PeerAddr,
        tag: Option<u64>,
    ) -> Result<EntryId> {
        let mut flags = Flags::INJECT;
        if data.is_some() {
            flags |= Flags::REMOTE_CQ_DATA;
        }
        self.check_inject(&[buf], flags)?;
        self.submit_send(SendRequest {
            iov: single_iov(buf),
            desc: MemDescs::new(),
            addr: dest,
            context: 0,
            data: data.unwrap_or(0),
            tag,
            flags,
        })
    }

    fn check_inject(&self, iov: &[IoVec], flags: Flags) -> Result<()> {
        let len = iov_total(iov);
        if flags.contains(Flags::INJECT) && len > self.config.inject_size {
            warn!(len, inject_size = self.config.inject_size, "inject payload too large");
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    fn submit_send(&self, req: SendRequest) -> Result<EntryId> {
        let result = self.state.lock().post_send(&self.transport, req);
        if let Err(err) = result {
            if err != Error::InvalidArgument {
                self.transport.progress();
            }
        }
        result
    }

    // ========================================================================
    // Receive Operations
    // ========================================================================

    /// Post a receive. `src` restricts the match when directed receive is
    /// enabled.
    pub fn recv(
        &self,
        buf: IoVec,
        desc: Option<MemDesc>,
        src: Option<PeerAddr>,
        context: u64,
    ) -> Result<()> {
        self.submit_recv(RecvRequest {
            kind: OpKind::Msg,
            iov: single_iov(buf),
            desc: single_desc(desc),
            addr: src,
            context,
            tag: 0,
            ignore: 0,
            flags: Flags::empty(),
            claim: None,
        })
    }

    pub fn recvv(
        &self,
        iov: &[IoVec],
        desc: &[MemDesc],
        src: Option<PeerAddr>,
        context: u64,
    ) -> Result<()> {
        self.submit_recv(RecvRequest {
            kind: OpKind::Msg,
            iov: bounded_iov(iov, self.config.rx_iov_limit)?,
            desc: bounded_desc(desc, self.config.rx_iov_limit)?,
            addr: src,
            context,
            tag: 0,
            ignore: 0,
            flags: Flags::empty(),
            claim: None,
        })
    }

    /// Post a receive described by `msg`. `MULTI_RECV` posts a multi-buffer
    /// receive.
    pub fn recvmsg(&self, msg: &Msg, flags: Flags) -> Result<()> {
        self.submit_recv(RecvRequest {
            kind: OpKind::Msg,
            iov: bounded_iov(&msg.iov, self.config.rx_iov_limit)?,
            desc: bounded_desc(&msg.desc, self.config.rx_iov_limit)?,
            addr: msg.addr,
            context: msg.context,
            tag: 0,
            ignore: 0,
            flags,
            claim: None,
        })
    }

    pub fn trecv(
        &self,
        buf: IoVec,
        desc: Option<MemDesc>,
        src: Option<PeerAddr>,
        tag: u64,
        ignore: u64,
        context: u64,
    ) -> Result<()> {
        self.submit_recv(RecvRequest {
            kind: OpKind::Tagged,
            iov: single_iov(buf),
            desc: single_desc(desc),
            addr: src,
            context,
            tag,
            ignore,
            flags: Flags::empty(),
            claim: None,
        })
    }

    pub fn trecvv(
        &self,
        iov: &[IoVec],
        desc: &[MemDesc],
        src: Option<PeerAddr>,
        tag: u64,
        ignore: u64,
        context: u64,
    ) -> Result<()> {
        self.submit_recv(RecvRequest {
            kind: OpKind::Tagged,
            iov: bounded_iov(iov, self.config.rx_iov_limit)?,
            desc: bounded_desc(desc, self.config.rx_iov_limit)?,
            addr: src,
            context,
            tag,
            ignore,
            flags: Flags::empty(),
            claim: None,
        })
    }

    /// Tagged receive with flags.
    ///
    /// - `PEEK`: report a matching unexpected message on the rx queue without
    ///   receiving it. With `CLAIM` the message is reserved and the returned
    ///   ticket must be passed back through a `CLAIM` receive. With `DISCARD`
    ///   it is dropped.
    /// - `CLAIM`: receive (or with `DISCARD`, drop) the message reserved by
    ///   `msg.claim`.
    /// - `DISCARD` alone is invalid.
    pub fn trecvmsg(&self, msg: &TaggedMsg, flags: Flags) -> Result<Option<ClaimTicket>> {
        let req = RecvRequest {
            kind: OpKind::Tagged,
            iov: bounded_iov(&msg.iov, self.config.rx_iov_limit)?,
            desc: bounded_desc(&msg.desc, self.config.rx_iov_limit)?,
            addr: msg.addr,
            context: msg.context,
            tag: msg.tag,
            ignore: msg.ignore,
            flags,
            claim: msg.claim,
        };

        if flags.contains(Flags::PEEK) {
            self.transport.progress();
            return self
                .state
                .lock()
                .peek(&self.transport, &*self.rx_cq, &req, flags);
        }

        if flags.contains(Flags::CLAIM) {
            let mut matched = Vec::new();
            let result = self.state.lock().claim(
                &self.transport,
                &*self.rx_cq,
                req,
                flags,
                &mut matched,
            );
            self.start_transfers(matched);
            return result.map(|()| None);
        }

        if flags.contains(Flags::DISCARD) {
            warn!("DISCARD requires PEEK or CLAIM");
            return Err(Error::InvalidArgument);
        }

        self.submit_recv(req).map(|()| None)
    }

    fn submit_recv(&self, req: RecvRequest) -> Result<()> {
        let mut matched = Vec::new();
        let result = self.state.lock().post_recv(req, &mut matched);
        if result == Err(Error::ResourceExhausted) {
            self.transport.progress();
        }
        self.start_transfers(matched);
        result
    }

    /// Cancel the posted receive carrying `context`. Returns `false` if none
    /// is posted.
    pub fn cancel(&self, context: u64) -> Result<bool> {
        self.state.lock().cancel(&*self.rx_cq, context)
    }

    // ========================================================================
    // Transport Callbacks
    // ========================================================================

    /// Deliver an incoming request-to-message packet.
    pub fn on_incoming(&self, rtm: &IncomingRtm) -> Result<Arrival> {
        let mut matched = Vec::new();
        let result = self.state.lock().on_incoming(rtm, &mut matched);
        self.start_transfers(matched);
        result
    }

    /// Report the end of a receive transfer.
    pub fn complete_recv(&self, id: EntryId, status: Result<()>) -> Result<()> {
        self.state
            .lock()
            .complete_recv(&self.transport, &*self.rx_cq, id, status)
    }

    /// Report the end of a send.
    pub fn complete_send(&self, id: EntryId, status: Result<()>) -> Result<()> {
        self.state.lock().complete_send(&*self.tx_cq, id, status)
    }

    /// Start the transfers of receives matched under the lock. A transfer
    /// that fails to start completes its receive with the error.
    fn start_transfers(&self, matched: Vec<MatchedRecv>) {
        for recv in matched {
            if let Err(err) = self.transport.start_receive_transfer(&recv) {
                warn!(id = ?recv.id, %err, "receive transfer failed to start");
                let completed = self.state.lock().complete_recv(
                    &self.transport,
                    &*self.rx_cq,
                    recv.id,
                    Err(err),
                );
                if let Err(err) = completed {
                    warn!(id = ?recv.id, %err, "failed to report transfer error");
                }
            }
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    #[inline]
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    #[inline]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[inline]
    pub fn tx_cq(&self) -> &Arc<CompletionQueue<R>> {
        &self.tx_cq
    }

    #[inline]
    pub fn rx_cq(&self) -> &Arc<CompletionQueue<R>> {
        &self.rx_cq
    }

    pub fn posted_len(&self, kind: OpKind) -> u32 {
        self.state.lock().posted_len(kind)
    }

    pub fn unexpected_len(&self, kind: OpKind) -> usize {
        self.state.lock().unexpected_len(kind)
    }

    pub fn tx_in_flight(&self) -> u32 {
        self.state.lock().tx_in_flight()
    }

    pub fn rx_in_flight(&self) -> u32 {
        self.state.lock().rx_in_flight()
    }

    pub fn next_msg_id(&self, peer: PeerAddr) -> u64 {
        self.state.lock().next_msg_id(peer)
    }

    /// Snapshot of a live rx entry.
    pub fn rx_entry(&self, id: EntryId) -> Option<OpEntry> {
        self.state.lock().rx_entry(id).cloned()
    }

    /// Snapshot of a live tx entry.
    pub fn tx_entry(&self, id: EntryId) -> Option<OpEntry> {
        self.state.lock().tx_entry(id).cloned()
    }

    pub fn rx_state(&self, id: EntryId) -> Option<EntryState> {
        self.state.lock().rx_entry(id).map(|e| e.state)
    }

    /// Compute state hash for determinism testing.
    pub fn state_hash(&self) -> u64 {
        self.state.lock().state_hash()
    }
}

impl<T: Transport, R: CqLock> Progress for Endpoint<T, R> {
    fn progress(&self) {
        self.transport.progress();
    }
}

impl<T: Transport, R: CqLock> fmt::Debug for Endpoint<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("config", &self.config)
            .field("tx_cq", &self.tx_cq)
            .field("rx_cq", &self.rx_cq)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CqFormat;
    use crate::config::{CqAttr, WaitObj};
    use crate::protocol::PacketType;
    use crate::sync::SingleThreadRawMutex;
    use crate::transport::mock::MockTransport;

    const PEER: PeerAddr = 9;

    fn cq() -> Arc<CompletionQueue> {
        Arc::new(
            CompletionQueue::new(CqAttr {
                size: 32,
                format: CqFormat::Tagged,
                wait_obj: WaitObj::Unspec,
                source: true,
            })
            .unwrap(),
        )
    }

    fn config() -> EndpointConfig {
        EndpointConfig {
            tx_capacity: 16,
            rx_capacity: 16,
            inject_size: 64,
            min_multi_recv_size: 64,
            ..EndpointConfig::default()
        }
    }

    fn endpoint(config: EndpointConfig) -> (Arc<Endpoint<Arc<MockTransport>>>, Arc<MockTransport>) {
        let transport = MockTransport::new();
        let ep = Endpoint::new(config, Arc::clone(&transport), cq(), cq()).unwrap();
        (ep, transport)
    }

    fn buf(len: usize) -> IoVec {
        IoVec::new(0x4000, len)
    }

    fn rtm(packet: u64, tag: Option<u64>, len: usize) -> IncomingRtm {
        IncomingRtm {
            packet,
            pkt_type: if tag.is_some() {
                PacketType::EagerTagRtm
            } else {
                PacketType::EagerMsgRtm
            },
            peer: PEER,
            tag: tag.unwrap_or(0),
            msg_len: len,
            data: None,
            msg_id: 0,
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = config();
        cfg.rx_capacity = 0;
        assert_eq!(
            Endpoint::new(cfg, MockTransport::new(), cq(), cq()).unwrap_err(),
            Error::InvalidArgument
        );
    }

    #[test]
    fn test_send_and_complete() {
        let (ep, transport) = endpoint(config());
        let id = ep.send(buf(100), None, PEER, 0xc0).unwrap();

        let posted = transport.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].id, id);
        assert_eq!(posted[0].pkt_type, PacketType::EagerMsgRtm);
        assert_eq!(ep.tx_in_flight(), 1);

        ep.complete_send(id, Ok(())).unwrap();
        let records = ep.tx_cq().read(4).unwrap();
        assert_eq!(records[0].context(), 0xc0);
        assert_eq!(records[0].len(), 100);
        assert_eq!(ep.tx_in_flight(), 0);
    }

    #[test]
    fn test_send_error_completion() {
        let (ep, _transport) = endpoint(config());
        let id = ep.tsend(buf(8), None, PEER, 0x77, 5).unwrap();
        ep.complete_send(id, Err(Error::Transport(-113))).unwrap();

        let err = ep.tx_cq().read_err().unwrap();
        assert_eq!(err.err, Error::Transport(-113));
        assert_eq!(err.prov_errno, -113);
        assert_eq!(err.tag, 0x77);
        assert!(err.flags.contains(Flags::TAGGED | Flags::SEND));
    }

    #[test]
    fn test_message_ids_per_peer() {
        let (ep, transport) = endpoint(config());
        ep.send(buf(1), None, PEER, 0).unwrap();
        ep.send(buf(1), None, PEER + 1, 0).unwrap();
        ep.send(buf(1), None, PEER, 0).unwrap();

        let ids: Vec<_> = transport.posted().iter().map(|p| (p.peer, p.msg_id)).collect();
        assert_eq!(ids, vec![(Some(PEER), 0), (Some(PEER + 1), 0), (Some(PEER), 1)]);
        assert_eq!(ep.next_msg_id(PEER), 2);
    }

    #[test]
    fn test_post_failure_progresses_and_rolls_back() {
        let (ep, transport) = endpoint(config());
        transport.state.lock().fail_post = Some(Error::Transport(-5));

        assert_eq!(ep.send(buf(10), None, PEER, 0).unwrap_err(), Error::Transport(-5));
        assert_eq!(transport.state.lock().progress_calls, 1);
        assert_eq!(ep.next_msg_id(PEER), 0);
        assert_eq!(ep.tx_in_flight(), 0);
    }

    #[test]
    fn test_backoff_is_retry() {
        let (ep, transport) = endpoint(config());
        transport.state.lock().backoff.insert(PEER);
        assert_eq!(ep.send(buf(10), None, PEER, 0).unwrap_err(), Error::Retry);
        assert!(transport.posted().is_empty());
    }

    #[test]
    fn test_delivery_complete_handshake() {
        let (ep, transport) = endpoint(config());
        let msg = Msg::new(buf(32), Some(PEER), 1);
        let flags = Flags::COMPLETION | Flags::DELIVERY_COMPLETE;

        assert_eq!(ep.sendmsg(&msg, flags).unwrap_err(), Error::Retry);
        assert_eq!(transport.state.lock().triggered, vec![PEER]);

        transport.handshake(PEER);
        ep.sendmsg(&msg, flags).unwrap();
        assert_eq!(transport.posted()[0].pkt_type, PacketType::DcEagerMsgRtm);
    }

    #[test]
    fn test_sendmsg_requires_address() {
        let (ep, _transport) = endpoint(config());
        let msg = Msg::new(buf(32), None, 1);
        assert_eq!(ep.sendmsg(&msg, Flags::empty()).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn test_iov_limit() {
        let mut cfg = config();
        cfg.tx_iov_limit = 2;
        let (ep, _transport) = endpoint(cfg);
        let iov = [buf(1), buf(1), buf(1)];
        assert_eq!(ep.sendv(&iov, &[], PEER, 0).unwrap_err(), Error::InvalidArgument);
        ep.sendv(&iov[..2], &[], PEER, 0).unwrap();
    }

    #[test]
    fn test_inject() {
        let (ep, transport) = endpoint(config());
        assert_eq!(ep.inject(buf(65), PEER).unwrap_err(), Error::InvalidArgument);
        assert!(transport.posted().is_empty());

        let id = ep.tinjectdata(buf(64), 0xdd, PEER, 4).unwrap();
        let entry = ep.tx_entry(id).unwrap();
        assert!(entry.fi_flags.contains(Flags::INJECT | Flags::REMOTE_CQ_DATA));
        assert_eq!(entry.cq_entry.data, 0xdd);

        ep.complete_send(id, Ok(())).unwrap();
        assert_eq!(ep.tx_cq().read(1).unwrap_err(), Error::Retry);
    }

    #[test]
    fn test_recv_then_arrival_starts_transfer() {
        let (ep, transport) = endpoint(config());
        ep.recv(buf(256), None, None, 42).unwrap();
        assert!(transport.transfers().is_empty());

        let arrival = ep.on_incoming(&rtm(1, None, 128)).unwrap();
        let transfers = transport.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].id, arrival.id());
        assert_eq!(ep.rx_state(arrival.id()), Some(EntryState::Matched));

        ep.complete_recv(arrival.id(), Ok(())).unwrap();
        let records = ep.rx_cq().read_from(1).unwrap();
        assert_eq!(records[0].0.context(), 42);
        assert_eq!(records[0].0.len(), 128);
        assert_eq!(records[0].1, None, "source not enabled on the endpoint");
        assert_eq!(transport.released(), vec![1]);
    }

    #[test]
    fn test_arrival_then_recv_starts_transfer() {
        let (ep, transport) = endpoint(config());
        let arrival = ep.on_incoming(&rtm(3, Some(0x10), 16)).unwrap();
        assert!(matches!(arrival, Arrival::Unexpected(_)));
        assert_eq!(ep.unexpected_len(OpKind::Tagged), 1);

        ep.trecv(buf(64), None, None, 0x10, 0, 7).unwrap();
        assert_eq!(transport.transfers().len(), 1);
        assert_eq!(ep.unexpected_len(OpKind::Tagged), 0);
    }

    #[test]
    fn test_transfer_start_failure_completes_with_error() {
        let (ep, transport) = endpoint(config());
        transport.state.lock().fail_transfer = Some(Error::Transport(-14));

        ep.on_incoming(&rtm(3, None, 16)).unwrap();
        ep.recv(buf(64), None, None, 8).unwrap();

        let err = ep.rx_cq().read_err().unwrap();
        assert_eq!(err.err, Error::Transport(-14));
        assert_eq!(err.context, 8);
        assert_eq!(ep.rx_in_flight(), 0);
        assert_eq!(transport.released(), vec![3]);
    }

    #[test]
    fn test_multi_recv_through_recvmsg() {
        let (ep, transport) = endpoint(config());
        for p in 0..4 {
            ep.on_incoming(&rtm(p, None, 30)).unwrap();
        }

        let msg = Msg::new(buf(100), None, 55);
        ep.recvmsg(&msg, Flags::MULTI_RECV).unwrap();

        // 100 -> 70 (kept) -> 40 (< 64, exhausted)
        let transfers = transport.transfers();
        assert_eq!(transfers.len(), 2);
        assert_eq!(ep.unexpected_len(OpKind::Msg), 2);
        assert_eq!(ep.posted_len(OpKind::Msg), 0);

        for t in &transfers {
            ep.complete_recv(t.id, Ok(())).unwrap();
        }
        let records = ep.rx_cq().read(8).unwrap();
        assert_eq!(records.len(), 2);
        assert!(!records[0].flags().contains(Flags::MULTI_RECV));
        assert!(records[1].flags().contains(Flags::MULTI_RECV));
        assert_eq!(ep.rx_in_flight(), 2, "only the two unexpected messages remain");
    }

    #[test]
    fn test_trecvmsg_peek_claim() {
        let (ep, transport) = endpoint(config());
        ep.on_incoming(&rtm(6, Some(0xaa), 24)).unwrap();

        let mut msg = TaggedMsg::new(buf(64), None, 0xaa, 0, 1);
        let ticket = ep
            .trecvmsg(&msg, Flags::PEEK | Flags::CLAIM)
            .unwrap()
            .expect("claimed");
        assert_eq!(transport.state.lock().progress_calls, 1);
        assert_eq!(ep.rx_cq().read(1).unwrap()[0].len(), 24);

        msg.claim = Some(ticket);
        assert_eq!(ep.trecvmsg(&msg, Flags::CLAIM).unwrap(), None);
        assert_eq!(transport.transfers().len(), 1);

        ep.complete_recv(ticket.entry(), Ok(())).unwrap();
        assert_eq!(
            ep.trecvmsg(&msg, Flags::CLAIM).unwrap_err(),
            Error::InvalidArgument
        );
    }

    #[test]
    fn test_discard_alone_invalid() {
        let (ep, _transport) = endpoint(config());
        let msg = TaggedMsg::new(buf(64), None, 1, 0, 1);
        assert_eq!(ep.trecvmsg(&msg, Flags::DISCARD).unwrap_err(), Error::InvalidArgument);
        assert_eq!(ep.trecvmsg(&msg, Flags::MULTI_RECV).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn test_cancel() {
        let (ep, _transport) = endpoint(config());
        ep.trecv(buf(64), None, None, 3, 0, 21).unwrap();
        assert!(ep.cancel(21).unwrap());
        assert!(!ep.cancel(21).unwrap());

        let err = ep.rx_cq().read_err().unwrap();
        assert_eq!(err.err, Error::Cancelled);
        assert_eq!(err.prov_errno, -125);
    }

    #[test]
    fn test_empty_cq_read_drives_transport() {
        let (ep, transport) = endpoint(config());
        assert_eq!(ep.rx_cq().read(1).unwrap_err(), Error::Retry);
        assert_eq!(transport.state.lock().progress_calls, 1);
        drop(ep);
    }

    #[test]
    fn test_shared_cq_bound_once() {
        let transport = MockTransport::new();
        let shared = cq();
        let _ep = Endpoint::new(
            config(),
            Arc::clone(&transport),
            Arc::clone(&shared),
            Arc::clone(&shared),
        )
        .unwrap();
        assert_eq!(shared.read(1).unwrap_err(), Error::Retry);
        assert_eq!(transport.state.lock().progress_calls, 1);
    }

    #[test]
    fn test_single_threaded_completion_queues() {
        let attr = CqAttr {
            size: 8,
            format: CqFormat::Tagged,
            wait_obj: WaitObj::None,
            source: false,
        };
        let transport = MockTransport::new();
        let ep: Arc<Endpoint<Arc<MockTransport>, SingleThreadRawMutex>> = Endpoint::new(
            config(),
            Arc::clone(&transport),
            Arc::new(CompletionQueue::single_threaded(attr).unwrap()),
            Arc::new(CompletionQueue::single_threaded(attr).unwrap()),
        )
        .unwrap();

        ep.trecv(buf(64), None, None, 7, 0, 11).unwrap();
        ep.on_incoming(&rtm(1, Some(7), 32)).unwrap();
        let transfers = transport.transfers();
        assert_eq!(transfers.len(), 1);
        ep.complete_recv(transfers[0].id, Ok(())).unwrap();

        let records = ep.rx_cq().read(4).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].context(), 11);
        assert_eq!(records[0].len(), 32);
        assert_eq!(transport.released(), vec![1]);

        let id = ep.send(buf(40), None, PEER, 12).unwrap();
        ep.complete_send(id, Ok(())).unwrap();
        assert_eq!(ep.tx_cq().read(4).unwrap()[0].context(), 12);

        // Empty reads still drive the endpoint
        assert_eq!(ep.rx_cq().read(1).unwrap_err(), Error::Retry);
        assert_eq!(transport.state.lock().progress_calls, 1);
    }

    #[test]
    fn test_rx_pool_exhaustion_progresses() {
        let mut cfg = config();
        cfg.rx_capacity = 1;
        let (ep, transport) = endpoint(cfg);
        ep.recv(buf(8), None, None, 1).unwrap();
        assert_eq!(
            ep.recv(buf(8), None, None, 2).unwrap_err(),
            Error::ResourceExhausted
        );
        assert_eq!(transport.state.lock().progress_calls, 1);
    }
}
