//! Latency report: runs one hot path in a pinned loop and prints an HDR
//! histogram of per-operation latency.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use flash_rdm::{
    BuddyAllocator, CompletionEntry, CompletionQueue, CqAttr, CqFormat, EndpointConfig, Endpoint,
    Flags, IncomingRtm, IoVec, MatchedRecv, OpEntry, PacketId, PacketType, PeerAddr, Result,
    Transport, WaitObj,
};
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Scenario {
    /// Buddy alloc + free of one block
    Buddy,
    /// Tagged receive, arrival, completion, CQ read
    Match,
    /// CQ write + read
    Cq,
}

#[derive(Debug, Parser)]
#[command(about = "Per-operation latency histogram for flash-rdm hot paths")]
struct Args {
    #[arg(long, value_enum, default_value = "match")]
    scenario: Scenario,

    #[arg(long, default_value_t = 1_000_000)]
    iterations: u64,

    /// Pin to the last available core
    #[arg(long)]
    pin: bool,
}

#[derive(Default)]
struct NullTransport {
    last: Mutex<Option<MatchedRecv>>,
}

impl Transport for NullTransport {
    fn post_packet(&self, _entry: &OpEntry, _pkt_type: PacketType, _flags: Flags) -> Result<()> {
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
        *self.last.lock() = Some(recv.clone());
        Ok(())
    }

    fn release_packet(&self, _packet: PacketId) {}
}

/// Pin the current thread to the last available CPU core.
fn pin_to_core() {
    if let Some(core_ids) = core_affinity::get_core_ids() {
        if let Some(last_core) = core_ids.last() {
            if core_affinity::set_for_current(*last_core) {
                info!(core = last_core.id, "pinned");
            }
        }
    }
}

fn cq_attr(size: usize) -> CqAttr {
    CqAttr {
        size,
        format: CqFormat::Tagged,
        wait_obj: WaitObj::None,
        source: false,
    }
}

/// Run `op` `iterations` times, recording each call's latency.
fn measure<F: FnMut(u64)>(iterations: u64, mut op: F) -> (Histogram<u64>, Duration) {
    let mut histogram =
        Histogram::<u64>::new_with_bounds(1, 1_000_000, 3).expect("static histogram bounds");
    let mut total = Duration::ZERO;

    for i in 0..iterations {
        let start = Instant::now();
        op(i);
        let elapsed = start.elapsed();

        histogram.record(elapsed.as_nanos() as u64).unwrap_or(());
        total += elapsed;
    }
    (histogram, total)
}

fn run(args: &Args) -> Result<(Histogram<u64>, Duration)> {
    match args.scenario {
        Scenario::Buddy => {
            let mut buddy = BuddyAllocator::new(0x1000_0000, 1 << 24, 1 << 20)?;
            let sizes = [16usize, 100, 4096, 70_000];
            let mut failed = None;
            let result = measure(args.iterations, |i| {
                let len = sizes[(i % sizes.len() as u64) as usize];
                match buddy.alloc(len).and_then(|addr| buddy.free(addr, len)) {
                    Ok(()) => {}
                    Err(e) => failed = Some(e),
                }
            });
            failed.map_or(Ok(result), Err)
        }
        Scenario::Match => {
            let transport = Arc::new(NullTransport::default());
            let ep = Endpoint::new(
                EndpointConfig::default(),
                Arc::clone(&transport),
                Arc::new(CompletionQueue::new(cq_attr(1024))?),
                Arc::new(CompletionQueue::new(cq_attr(1024))?),
            )?;
            let mut failed = None;
            let result = measure(args.iterations, |i| {
                let rtm = IncomingRtm {
                    packet: i,
                    pkt_type: PacketType::EagerTagRtm,
                    peer: 1,
                    tag: 9,
                    msg_len: 64,
                    data: None,
                    msg_id: i,
                };
                let step = ep
                    .trecv(IoVec::new(0x1000, 128), None, None, 9, 0, i)
                    .and_then(|()| ep.on_incoming(&rtm))
                    .and_then(|_| {
                        let matched = transport.last.lock().take();
                        match matched {
                            Some(m) => ep.complete_recv(m.id, Ok(())),
                            None => Ok(()),
                        }
                    })
                    .and_then(|()| ep.rx_cq().read(1).map(|_| ()));
                if let Err(e) = step {
                    failed = Some(e);
                }
            });
            failed.map_or(Ok(result), Err)
        }
        Scenario::Cq => {
            let cq = CompletionQueue::new(cq_attr(1024))?;
            let entry = CompletionEntry {
                context: 1,
                flags: Flags::SEND | Flags::MSG,
                len: 64,
                ..CompletionEntry::default()
            };
            let mut failed = None;
            let result = measure(args.iterations, |_| {
                if let Err(e) = cq.write(&entry).and_then(|()| cq.read(1).map(|_| ())) {
                    failed = Some(e);
                }
            });
            failed.map_or(Ok(result), Err)
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if args.pin {
        pin_to_core();
    }

    println!("Running {:?} for {} iterations...", args.scenario, args.iterations);

    let (histogram, total_duration) = match run(&args) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("benchmark failed: {} ({})", e, e.errno());
            std::process::exit(1);
        }
    };

    println!("\n=== Latency Report (ns) ===");
    println!("Total Ops:  {}", args.iterations);
    println!(
        "Throughput: {:.2} ops/sec",
        args.iterations as f64 / total_duration.as_secs_f64()
    );
    println!("---------------------------");
    println!("Min:    {:6} ns", histogram.min());
    println!("P50:    {:6} ns", histogram.value_at_quantile(0.50));
    println!("P90:    {:6} ns", histogram.value_at_quantile(0.90));
    println!("P99:    {:6} ns", histogram.value_at_quantile(0.99));
    println!("P99.9:  {:6} ns", histogram.value_at_quantile(0.999));
    println!("P99.99: {:6} ns", histogram.value_at_quantile(0.9999));
    println!("Max:    {:6} ns", histogram.max());
    println!("---------------------------");

    println!("\nDistribution:");
    for v in histogram.iter_log(100, 2.0) {
        let count = v.count_since_last_iteration();
        if count > 0 {
            println!("<= {:8} ns: {:10} count", v.value_iterated_to(), count);
        }
    }
}
