//! Determinism Test - Golden Master verification.
//!
//! Verifies that the allocator and the endpoint produce identical results
//! across runs when given the same input sequence.

use flash_rdm::{
    BuddyAllocator, CompletionQueue, CqAttr, CqFormat, EndpointConfig, EntryId, Endpoint,
    Error, IncomingRtm, IoVec, MatchedRecv, OpEntry, PacketId, PacketType, PeerAddr, Result,
    Transport, WaitObj, Flags,
};
use parking_lot::Mutex;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

// ============================================================================
// Buddy Allocator
// ============================================================================

#[derive(Clone, Copy, Debug)]
enum AllocOp {
    Alloc(usize),
    /// Free the n-th live block (modulo live count)
    Free(usize),
}

fn generate_alloc_ops(seed: u64, count: usize) -> Vec<AllocOp> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            if rng.gen_bool(0.55) {
                AllocOp::Alloc(rng.gen_range(1..=4096))
            } else {
                AllocOp::Free(rng.gen_range(0..usize::MAX))
            }
        })
        .collect()
}

fn run_allocator(ops: &[AllocOp]) -> (u64, u64) {
    let mut buddy = BuddyAllocator::new(0x10_0000, 1 << 20, 1 << 14).unwrap();
    let mut live: Vec<(usize, usize)> = Vec::new();
    let mut hasher = DefaultHasher::new();

    for op in ops {
        match *op {
            AllocOp::Alloc(len) => match buddy.alloc(len) {
                Ok(addr) => {
                    addr.hash(&mut hasher);
                    live.push((addr, len));
                }
                Err(err) => err.errno().hash(&mut hasher),
            },
            AllocOp::Free(n) => {
                if live.is_empty() {
                    continue;
                }
                let (addr, len) = live.swap_remove(n % live.len());
                buddy.free(addr, len).unwrap();
            }
        }
    }

    (hasher.finish(), buddy.state_hash())
}

#[test]
fn test_allocator_determinism() {
    const SEED: u64 = 0xDEADBEEF;
    const COUNT: usize = 20_000;
    const RUNS: usize = 5;

    let ops = generate_alloc_ops(SEED, COUNT);
    let (first_event_hash, first_state_hash) = run_allocator(&ops);

    for run in 1..RUNS {
        let (event_hash, state_hash) = run_allocator(&ops);
        assert_eq!(event_hash, first_event_hash, "Address hash mismatch on run {}", run);
        assert_eq!(state_hash, first_state_hash, "State hash mismatch on run {}", run);
    }

    println!("Allocator determinism test passed!");
    println!("  Ops: {}", COUNT);
    println!("  Address hash: {:#018x}", first_event_hash);
    println!("  State hash: {:#018x}", first_state_hash);
}

// ============================================================================
// Endpoint
// ============================================================================

/// Transport that records everything and delivers nothing on its own.
#[derive(Default)]
struct RecordingTransport {
    posted: Mutex<VecDeque<EntryId>>,
    transfers: Mutex<VecDeque<MatchedRecv>>,
    released: Mutex<Vec<PacketId>>,
}

impl Transport for RecordingTransport {
    fn post_packet(&self, entry: &OpEntry, _pkt_type: PacketType, _flags: Flags) -> Result<()> {
        self.posted.lock().push_back(entry.id);
        Ok(())
    }

    fn trigger_handshake(&self, _peer: PeerAddr) -> Result<()> {
        Ok(())
    }

    fn handshake_received(&self, _peer: PeerAddr) -> bool {
        true
    }

    fn peer_supports(&self, _pkt_type: PacketType, _peer: PeerAddr) -> bool {
        true
    }

    fn peer_in_backoff(&self, _peer: PeerAddr) -> bool {
        false
    }

    fn progress(&self) {}

    fn start_receive_transfer(&self, recv: &MatchedRecv) -> Result<()> {
        self.transfers.lock().push_back(recv.clone());
        Ok(())
    }

    fn release_packet(&self, packet: PacketId) {
        self.released.lock().push(packet);
    }
}

#[derive(Clone, Copy, Debug)]
enum EpOp {
    Send { peer: PeerAddr, len: usize, tag: Option<u64> },
    Recv { len: usize, tag: Option<u64>, context: u64 },
    Arrive { peer: PeerAddr, len: usize, tag: Option<u64> },
    CompleteSend,
    CompleteRecv,
}

fn generate_ep_ops(seed: u64, count: usize) -> Vec<EpOp> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut ops = Vec::with_capacity(count);

    for i in 0..count {
        let tag = if rng.gen_bool(0.5) {
            Some(rng.gen_range(0..8u64))
        } else {
            None
        };
        let op = match rng.gen_range(0..100) {
            0..=11 => EpOp::Send {
                peer: rng.gen_range(1..5),
                len: rng.gen_range(1..20_000),
                tag,
            },
            12..=33 => EpOp::Recv {
                len: rng.gen_range(1..4096),
                tag,
                context: i as u64,
            },
            34..=55 => EpOp::Arrive {
                peer: rng.gen_range(1..5),
                len: rng.gen_range(1..4096),
                tag,
            },
            56..=69 => EpOp::CompleteSend,
            _ => EpOp::CompleteRecv,
        };
        ops.push(op);
    }
    ops
}

fn hash_result<T>(result: &std::result::Result<T, Error>, hasher: &mut DefaultHasher) {
    match result {
        Ok(_) => 0i32.hash(hasher),
        Err(err) => err.errno().hash(hasher),
    }
}

fn drain(cq: &CompletionQueue, hasher: &mut DefaultHasher) {
    loop {
        match cq.read(16) {
            Ok(records) => {
                for r in records {
                    (r.context(), r.flags().bits(), r.len()).hash(hasher);
                }
            }
            Err(Error::ErrorAvailable) => {
                let err = cq.read_err().unwrap();
                (err.context, err.err.errno(), err.olen).hash(hasher);
            }
            Err(_) => return,
        }
    }
}

fn run_endpoint(ops: &[EpOp]) -> (u64, u64) {
    let transport = Arc::new(RecordingTransport::default());
    let attr = CqAttr {
        size: 64,
        format: CqFormat::Tagged,
        wait_obj: WaitObj::None,
        source: false,
    };
    let tx_cq = Arc::new(CompletionQueue::new(attr).unwrap());
    let rx_cq = Arc::new(CompletionQueue::new(attr).unwrap());
    let config = EndpointConfig {
        tx_capacity: 4096,
        rx_capacity: 4096,
        ..EndpointConfig::default()
    };
    let ep = Endpoint::new(config, Arc::clone(&transport), tx_cq, rx_cq).unwrap();

    let mut hasher = DefaultHasher::new();
    let mut next_packet = 0u64;

    for op in ops {
        match *op {
            EpOp::Send { peer, len, tag } => {
                let buf = IoVec::new(0x1000, len);
                let result = match tag {
                    Some(tag) => ep.tsend(buf, None, peer, tag, 0),
                    None => ep.send(buf, None, peer, 0),
                };
                hash_result(&result, &mut hasher);
            }
            EpOp::Recv { len, tag, context } => {
                let buf = IoVec::new(0x8000, len);
                let result = match tag {
                    Some(tag) => ep.trecv(buf, None, None, tag, 0, context),
                    None => ep.recv(buf, None, None, context),
                };
                hash_result(&result, &mut hasher);
            }
            EpOp::Arrive { peer, len, tag } => {
                next_packet += 1;
                let rtm = IncomingRtm {
                    packet: next_packet,
                    pkt_type: if tag.is_some() {
                        PacketType::EagerTagRtm
                    } else {
                        PacketType::EagerMsgRtm
                    },
                    peer,
                    tag: tag.unwrap_or(0),
                    msg_len: len,
                    data: None,
                    msg_id: next_packet,
                };
                hash_result(&ep.on_incoming(&rtm), &mut hasher);
            }
            EpOp::CompleteSend => {
                let next = transport.posted.lock().pop_front();
                if let Some(id) = next {
                    ep.complete_send(id, Ok(())).unwrap();
                }
            }
            EpOp::CompleteRecv => {
                let next = transport.transfers.lock().pop_front();
                if let Some(recv) = next {
                    recv.len.hash(&mut hasher);
                    ep.complete_recv(recv.id, Ok(())).unwrap();
                }
            }
        }

        drain(ep.tx_cq(), &mut hasher);
        drain(ep.rx_cq(), &mut hasher);
    }

    (hasher.finish(), ep.state_hash())
}

#[test]
fn test_endpoint_determinism_small() {
    const SEED: u64 = 0xDEADBEEF;
    const COUNT: usize = 1000;
    const RUNS: usize = 10;

    let ops = generate_ep_ops(SEED, COUNT);
    let (first_event_hash, first_state_hash) = run_endpoint(&ops);

    for run in 1..RUNS {
        let (event_hash, state_hash) = run_endpoint(&ops);
        assert_eq!(event_hash, first_event_hash, "Event hash mismatch on run {}", run);
        assert_eq!(state_hash, first_state_hash, "State hash mismatch on run {}", run);
    }

    println!("Determinism test passed!");
    println!("  Ops: {}", COUNT);
    println!("  Runs: {}", RUNS);
    println!("  Event hash: {:#018x}", first_event_hash);
    println!("  State hash: {:#018x}", first_state_hash);
}

#[test]
fn test_endpoint_determinism_large() {
    const SEED: u64 = 0xCAFEBABE;
    const COUNT: usize = 50_000;
    const RUNS: usize = 3;

    let ops = generate_ep_ops(SEED, COUNT);
    let (first_event_hash, first_state_hash) = run_endpoint(&ops);

    for run in 1..RUNS {
        let (event_hash, state_hash) = run_endpoint(&ops);
        assert_eq!(event_hash, first_event_hash, "Event hash mismatch on run {}", run);
        assert_eq!(state_hash, first_state_hash, "State hash mismatch on run {}", run);
    }
}

#[test]
fn test_different_seeds_produce_different_results() {
    let (hash1, _) = run_endpoint(&generate_ep_ops(1, 1000));
    let (hash2, _) = run_endpoint(&generate_ep_ops(2, 1000));
    assert_ne!(hash1, hash2, "Different seeds should produce different results");
}
