//! Completion Queue - bounded ring plus an unbounded auxiliary list.
//!
//! # Layout
//!
//! ```text
//!  ring (capacity N)                       aux (FIFO)
//! ┌─────┬─────┬─────┬─────┐          ┌────────┬────────┬────────┐
//! │ E 0 │ E 1 │ AUX │ E 3 │          │ seq=2  │ seq=2  │ seq=2  │
//! └─────┴─────┴──┬──┴─────┘          └────────┴────────┴────────┘
//!                └──────── marker owning every aux record tagged seq=2
//! ```
//!
//! A plain completion goes straight into the ring while more than one slot
//! is free. Otherwise it is appended to the aux list, tied to an aux marker:
//! a fresh marker if the ring still has a slot, else the marker at the tail
//! (the last slot is only ever filled by a marker). Error records always go
//! through the aux path so a reader meets them in order. Reading a marker
//! drains its aux records; the marker itself is retired when none remain.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::lock_api::{self, RawMutex};
use tracing::{debug, trace};

use crate::completion::{CompletionEntry, CqRecord, ErrorEntry};
use crate::config::{CqAttr, WaitObj};
use crate::error::{Error, Result};
use crate::msg::{Flags, PeerAddr};
use crate::sync::SingleThreadRawMutex;
use crate::wait::WaitObject;

/// Something a completion queue drives when a reader finds it empty.
pub trait Progress {
    fn progress(&self);
}

/// Lock protecting a completion queue.
///
/// `Binding` is the handle the queue keeps to its endpoints. A queue shared
/// across threads may only hold `Send + Sync` endpoints.
pub trait CqLock: RawMutex {
    type Binding: ?Sized + Progress;
}

impl CqLock for parking_lot::RawMutex {
    type Binding = dyn Progress + Send + Sync;
}

impl CqLock for SingleThreadRawMutex {
    type Binding = dyn Progress;
}

/// Queues an endpoint of type `P` can be bound to.
pub trait BindProgress<P> {
    fn bind_endpoint(&self, endpoint: Weak<P>);
}

impl<P: Progress + Send + Sync + 'static> BindProgress<P> for CompletionQueue {
    fn bind_endpoint(&self, endpoint: Weak<P>) {
        let endpoint: Weak<dyn Progress + Send + Sync> = endpoint;
        self.bind(endpoint);
    }
}

impl<P: Progress + 'static> BindProgress<P> for CompletionQueue<SingleThreadRawMutex> {
    fn bind_endpoint(&self, endpoint: Weak<P>) {
        let endpoint: Weak<dyn Progress> = endpoint;
        self.bind(endpoint);
    }
}

enum SlotKind {
    Entry(CompletionEntry),
    Aux,
}

struct Slot {
    seq: u64,
    kind: SlotKind,
    src: Option<PeerAddr>,
}

enum AuxRecord {
    Completion {
        entry: CompletionEntry,
        src: Option<PeerAddr>,
    },
    Error(ErrorEntry),
}

struct AuxEntry {
    /// Sequence number of the owning marker slot
    slot_seq: u64,
    record: AuxRecord,
}

struct CqState {
    ring: VecDeque<Slot>,
    aux: VecDeque<AuxEntry>,
    next_seq: u64,
}

/// Completion queue, generic over the lock protecting it.
///
/// The default `parking_lot::RawMutex` makes the queue `Send + Sync`. A
/// `CompletionQueue<SingleThreadRawMutex>` elides real locking and is
/// `!Sync`.
pub struct CompletionQueue<R: CqLock = parking_lot::RawMutex> {
    state: lock_api::Mutex<R, CqState>,
    attr: CqAttr,
    wait: Option<WaitObject>,
    signaled: AtomicBool,
    endpoints: parking_lot::Mutex<Vec<Weak<R::Binding>>>,
    #[cfg(test)]
    fail_writes: AtomicBool,
}

impl CompletionQueue {
    /// Create a thread-safe queue.
    pub fn new(attr: CqAttr) -> Result<Self> {
        Self::with_lock(attr)
    }
}

impl CompletionQueue<SingleThreadRawMutex> {
    /// Create a queue for a single thread of producers and consumers.
    pub fn single_threaded(attr: CqAttr) -> Result<Self> {
        Self::with_lock(attr)
    }
}

impl<R: CqLock> CompletionQueue<R> {
    /// Create a queue protected by `R`.
    pub fn with_lock(attr: CqAttr) -> Result<Self> {
        let attr = attr.resolve()?;

        let mut ring = VecDeque::new();
        ring.try_reserve_exact(attr.size)
            .map_err(|_| Error::OutOfMemory)?;

        let wait = match attr.wait_obj {
            WaitObj::None => None,
            WaitObj::Unspec => Some(WaitObject::new()),
        };

        Ok(Self {
            state: lock_api::Mutex::new(CqState {
                ring,
                aux: VecDeque::new(),
                next_seq: 0,
            }),
            attr,
            wait,
            signaled: AtomicBool::new(false),
            endpoints: parking_lot::Mutex::new(Vec::new()),
            #[cfg(test)]
            fail_writes: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn attr(&self) -> &CqAttr {
        &self.attr
    }

    /// Ring slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.attr.size
    }

    /// Records waiting to be read, errors included.
    pub fn len(&self) -> usize {
        let st = self.state.lock();
        let entries = st
            .ring
            .iter()
            .filter(|slot| matches!(slot.kind, SlotKind::Entry(_)))
            .count();
        entries + st.aux.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().ring.is_empty()
    }

    /// Records held in the aux list.
    pub fn overflow_len(&self) -> usize {
        self.state.lock().aux.len()
    }

    /// Register an endpoint to be progressed when a read finds the queue
    /// empty. Dropped endpoints are pruned lazily.
    pub fn bind(&self, endpoint: Weak<R::Binding>) {
        self.endpoints.lock().push(endpoint);
    }

    fn progress_endpoints(&self) {
        let live: Vec<Arc<R::Binding>> = {
            let mut endpoints = self.endpoints.lock();
            endpoints.retain(|ep| ep.strong_count() > 0);
            endpoints.iter().filter_map(Weak::upgrade).collect()
        };
        for ep in live {
            ep.progress();
        }
    }

    #[inline]
    fn notify(&self) {
        if let Some(wait) = &self.wait {
            wait.notify();
        }
    }

    // ========================================================================
    // Writer Side
    // ========================================================================

    /// Append a completion.
    pub fn write(&self, entry: &CompletionEntry) -> Result<()> {
        self.write_inner(*entry, None)
    }

    /// Append a completion tagged with its source address.
    pub fn write_src(&self, entry: &CompletionEntry, src: PeerAddr) -> Result<()> {
        self.write_inner(*entry, Some(src))
    }

    fn write_inner(&self, entry: CompletionEntry, src: Option<PeerAddr>) -> Result<()> {
        self.check_write()?;
        let src = if self.attr.source { src } else { None };
        {
            let mut st = self.state.lock();
            if self.attr.size - st.ring.len() > 1 {
                let seq = st.next_seq;
                st.next_seq += 1;
                st.ring.push_back(Slot {
                    seq,
                    kind: SlotKind::Entry(entry),
                    src,
                });
            } else {
                debug!(context = entry.context, "completion queue overflow");
                self.insert_aux(&mut st, AuxRecord::Completion { entry, src })?;
            }
        }
        self.notify();
        Ok(())
    }

    /// Append an error record.
    pub fn write_error(&self, err: ErrorEntry) -> Result<()> {
        trace!(context = err.context, err = %err.err, "cq error write");
        self.check_write()?;
        {
            let mut st = self.state.lock();
            self.insert_aux(&mut st, AuxRecord::Error(err))?;
        }
        self.notify();
        Ok(())
    }

    /// Report that a peek found no matching message.
    pub fn write_error_peek(&self, context: u64, flags: Flags, tag: u64) -> Result<()> {
        let template = CompletionEntry {
            context,
            flags,
            tag,
            ..CompletionEntry::default()
        };
        self.write_error(ErrorEntry::from_template(&template, Error::NoMessage))
    }

    /// Report that a message did not fit; `olen` bytes were dropped.
    pub fn write_error_trunc(&self, entry: &CompletionEntry, olen: usize) -> Result<()> {
        let mut err = ErrorEntry::from_template(entry, Error::Truncated);
        err.olen = olen;
        self.write_error(err)
    }

    /// Writes fail with `OutOfMemory` while set.
    #[cfg(test)]
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    #[inline]
    fn check_write(&self) -> Result<()> {
        #[cfg(test)]
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::OutOfMemory);
        }
        Ok(())
    }

    fn insert_aux(&self, st: &mut CqState, record: AuxRecord) -> Result<()> {
        st.aux.try_reserve(1).map_err(|_| Error::OutOfMemory)?;

        let slot_seq = if st.ring.len() < self.attr.size {
            let seq = st.next_seq;
            st.next_seq += 1;
            st.ring.push_back(Slot {
                seq,
                kind: SlotKind::Aux,
                src: None,
            });
            seq
        } else {
            // Ring full: its tail is always a marker
            st.ring.back().map_or(0, |slot| slot.seq)
        };

        st.aux.push_back(AuxEntry { slot_seq, record });
        Ok(())
    }

    // ========================================================================
    // Reader Side
    // ========================================================================

    /// Read up to `max` completions, projected to the queue's format.
    ///
    /// # Errors
    /// `Retry` if nothing is available after driving bound endpoints;
    /// `ErrorAvailable` if the next record is an error.
    pub fn read(&self, max: usize) -> Result<Vec<CqRecord>> {
        Ok(self
            .read_inner(max)?
            .into_iter()
            .map(|(entry, _)| entry.project(self.attr.format))
            .collect())
    }

    /// Like [`read`](Self::read), also returning each record's source
    /// address when the queue records sources.
    pub fn read_from(&self, max: usize) -> Result<Vec<(CqRecord, Option<PeerAddr>)>> {
        Ok(self
            .read_inner(max)?
            .into_iter()
            .map(|(entry, src)| (entry.project(self.attr.format), src))
            .collect())
    }

    fn read_inner(&self, max: usize) -> Result<Vec<(CompletionEntry, Option<PeerAddr>)>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut st = self.state.lock();
        if st.ring.is_empty() {
            drop(st);
            self.progress_endpoints();
            st = self.state.lock();
            if st.ring.is_empty() {
                return Err(Error::Retry);
            }
        }

        let mut out = Vec::with_capacity(max.min(st.ring.len()));
        while out.len() < max {
            let Some(slot) = st.ring.front() else {
                break;
            };

            match slot.kind {
                SlotKind::Entry(entry) => {
                    out.push((entry, slot.src));
                    st.ring.pop_front();
                }
                SlotKind::Aux => {
                    let seq = slot.seq;
                    let Some(aux) = st.aux.front() else {
                        st.ring.pop_front();
                        continue;
                    };
                    match &aux.record {
                        AuxRecord::Error(_) => {
                            if out.is_empty() {
                                return Err(Error::ErrorAvailable);
                            }
                            break;
                        }
                        AuxRecord::Completion { entry, src } => {
                            out.push((*entry, *src));
                            st.aux.pop_front();
                            Self::retire_marker(&mut st, seq);
                        }
                    }
                }
            }
        }

        Ok(out)
    }

    /// Pop the marker `seq` from the ring once it owns no aux records.
    fn retire_marker(st: &mut CqState, seq: u64) {
        if st.aux.front().map_or(true, |aux| aux.slot_seq != seq) {
            st.ring.pop_front();
        }
    }

    /// Take the error record at the head of the queue.
    ///
    /// # Errors
    /// `Retry` if the head is not an error record.
    pub fn read_err(&self) -> Result<ErrorEntry> {
        let mut st = self.state.lock();

        let seq = match st.ring.front() {
            Some(Slot {
                seq,
                kind: SlotKind::Aux,
                ..
            }) => *seq,
            _ => return Err(Error::Retry),
        };

        if !matches!(
            st.aux.front(),
            Some(AuxEntry {
                record: AuxRecord::Error(_),
                ..
            })
        ) {
            return Err(Error::Retry);
        }

        let Some(AuxEntry {
            record: AuxRecord::Error(err),
            ..
        }) = st.aux.pop_front()
        else {
            return Err(Error::Retry);
        };
        Self::retire_marker(&mut st, seq);
        Ok(err)
    }

    /// Blocking [`read`](Self::read). `None` waits without a deadline.
    ///
    /// # Errors
    /// `Unsupported` without a wait object; `Retry` on timeout or when
    /// interrupted by [`signal`](Self::signal).
    pub fn sread(&self, max: usize, timeout: Option<Duration>) -> Result<Vec<CqRecord>> {
        self.blocking(timeout, || self.read(max))
    }

    /// Blocking [`read_from`](Self::read_from).
    pub fn sread_from(
        &self,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<(CqRecord, Option<PeerAddr>)>> {
        self.blocking(timeout, || self.read_from(max))
    }

    fn blocking<T, F>(&self, timeout: Option<Duration>, mut read: F) -> Result<Vec<T>>
    where
        F: FnMut() -> Result<Vec<T>>,
    {
        let wait = self.wait.as_ref().ok_or(Error::Unsupported)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let seen = wait.epoch();
            match read() {
                Err(Error::Retry) => {}
                other => return other,
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(Error::Retry);
                    }
                    Some(left)
                }
                None => None,
            };

            if self.signaled.swap(false, Ordering::AcqRel) {
                return Err(Error::Retry);
            }

            if !wait.wait_since(seen, remaining) {
                return Err(Error::Retry);
            }
        }
    }

    /// Wake a blocked reader, which returns `Retry`.
    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
        if let Some(wait) = &self.wait {
            wait.notify();
        }
    }
}

impl<R: CqLock> fmt::Debug for CompletionQueue<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("attr", &self.attr)
            .field("signaled", &self.signaled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CqFormat;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn attr(size: usize) -> CqAttr {
        CqAttr {
            size,
            format: CqFormat::Tagged,
            wait_obj: WaitObj::Unspec,
            source: true,
        }
    }

    fn entry(context: u64) -> CompletionEntry {
        CompletionEntry {
            context,
            flags: Flags::RECV | Flags::MSG,
            len: context as usize,
            ..CompletionEntry::default()
        }
    }

    fn contexts(records: &[CqRecord]) -> Vec<u64> {
        records.iter().map(CqRecord::context).collect()
    }

    #[test]
    fn test_empty_read_retries() {
        let cq = CompletionQueue::new(attr(4)).unwrap();
        assert_eq!(cq.read(8).unwrap_err(), Error::Retry);
        assert_eq!(cq.read_err().unwrap_err(), Error::Retry);
        assert!(cq.read(0).unwrap().is_empty());
    }

    #[test]
    fn test_fifo_within_ring() {
        let cq = CompletionQueue::new(attr(8)).unwrap();
        for c in 1..=3 {
            cq.write(&entry(c)).unwrap();
        }
        assert_eq!(cq.overflow_len(), 0);
        assert_eq!(contexts(&cq.read(2).unwrap()), vec![1, 2]);
        assert_eq!(contexts(&cq.read(8).unwrap()), vec![3]);
        assert_eq!(cq.read(8).unwrap_err(), Error::Retry);
    }

    #[test]
    fn test_overflow_preserves_order() {
        let cq = CompletionQueue::new(attr(4)).unwrap();
        for c in 0..10 {
            cq.write(&entry(c)).unwrap();
        }
        // Three direct slots, everything after goes through the aux list
        assert_eq!(cq.overflow_len(), 7);
        assert_eq!(cq.len(), 10);

        let mut seen = Vec::new();
        while let Ok(records) = cq.read(3) {
            seen.extend(contexts(&records));
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert!(cq.is_empty());
    }

    #[test]
    fn test_interleaved_overflow_and_reads() {
        let cq = CompletionQueue::new(attr(3)).unwrap();
        let mut next = 0;
        let mut seen = Vec::new();
        for round in 0..20 {
            for _ in 0..(round % 4 + 1) {
                cq.write(&entry(next)).unwrap();
                next += 1;
            }
            if let Ok(records) = cq.read(2) {
                seen.extend(contexts(&records));
            }
        }
        while let Ok(records) = cq.read(16) {
            seen.extend(contexts(&records));
        }
        assert_eq!(seen, (0..next).collect::<Vec<_>>());
    }

    #[test]
    fn test_capacity_one_always_overflows() {
        let cq = CompletionQueue::new(attr(1)).unwrap();
        cq.write(&entry(1)).unwrap();
        cq.write(&entry(2)).unwrap();
        assert_eq!(cq.overflow_len(), 2);
        assert_eq!(contexts(&cq.read(4).unwrap()), vec![1, 2]);
    }

    #[test]
    fn test_error_stops_read() {
        let cq = CompletionQueue::new(attr(8)).unwrap();
        cq.write(&entry(1)).unwrap();
        cq.write(&entry(2)).unwrap();
        cq.write_error_trunc(&entry(3), 100).unwrap();
        cq.write(&entry(4)).unwrap();

        assert_eq!(contexts(&cq.read(8).unwrap()), vec![1, 2]);
        assert_eq!(cq.read(8).unwrap_err(), Error::ErrorAvailable);

        let err = cq.read_err().unwrap();
        assert_eq!(err.context, 3);
        assert_eq!(err.err, Error::Truncated);
        assert_eq!(err.olen, 100);

        assert_eq!(cq.read_err().unwrap_err(), Error::Retry);
        assert_eq!(contexts(&cq.read(8).unwrap()), vec![4]);
    }

    #[test]
    fn test_error_in_shared_marker() {
        let cq = CompletionQueue::new(attr(2)).unwrap();
        // capacity 2: first write direct, rest through one marker
        cq.write(&entry(1)).unwrap();
        cq.write(&entry(2)).unwrap();
        cq.write_error_peek(3, Flags::TAGGED | Flags::RECV, 0x99).unwrap();
        cq.write(&entry(4)).unwrap();

        assert_eq!(contexts(&cq.read(8).unwrap()), vec![1, 2]);
        let err = cq.read_err().unwrap();
        assert_eq!(err.err, Error::NoMessage);
        assert_eq!(err.tag, 0x99);
        assert_eq!(contexts(&cq.read(8).unwrap()), vec![4]);
        assert_eq!(cq.read(8).unwrap_err(), Error::Retry);
    }

    #[test]
    fn test_read_from_source() {
        let cq = CompletionQueue::new(attr(8)).unwrap();
        cq.write_src(&entry(1), 42).unwrap();
        cq.write(&entry(2)).unwrap();

        let records = cq.read_from(8).unwrap();
        assert_eq!(records[0].1, Some(42));
        assert_eq!(records[1].1, None);

        let no_src = CompletionQueue::new(CqAttr {
            source: false,
            ..attr(8)
        })
        .unwrap();
        no_src.write_src(&entry(1), 42).unwrap();
        assert_eq!(no_src.read_from(1).unwrap()[0].1, None);
    }

    #[test]
    fn test_format_projection() {
        let cq = CompletionQueue::new(CqAttr {
            format: CqFormat::Context,
            ..attr(4)
        })
        .unwrap();
        cq.write(&entry(5)).unwrap();
        assert_eq!(cq.read(1).unwrap(), vec![CqRecord::Context { context: 5 }]);
    }

    struct CountingProgress {
        calls: AtomicUsize,
    }

    impl Progress for CountingProgress {
        fn progress(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_empty_read_drives_progress() {
        let cq = CompletionQueue::new(attr(4)).unwrap();
        let ep = Arc::new(CountingProgress {
            calls: AtomicUsize::new(0),
        });
        cq.bind_endpoint(Arc::downgrade(&ep));

        assert_eq!(cq.read(1).unwrap_err(), Error::Retry);
        assert_eq!(ep.calls.load(Ordering::SeqCst), 1);

        cq.write(&entry(1)).unwrap();
        cq.read(1).unwrap();
        assert_eq!(ep.calls.load(Ordering::SeqCst), 1);

        drop(ep);
        assert_eq!(cq.read(1).unwrap_err(), Error::Retry);
    }

    #[test]
    fn test_sread_requires_wait_object() {
        let cq = CompletionQueue::new(CqAttr {
            wait_obj: WaitObj::None,
            ..attr(4)
        })
        .unwrap();
        assert_eq!(
            cq.sread(1, Some(Duration::from_millis(1))).unwrap_err(),
            Error::Unsupported
        );
    }

    #[test]
    fn test_sread_timeout() {
        let cq = CompletionQueue::new(attr(4)).unwrap();
        let start = Instant::now();
        assert_eq!(
            cq.sread(1, Some(Duration::from_millis(50))).unwrap_err(),
            Error::Retry
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50), "returned after {:?}", elapsed);
    }

    #[test]
    fn test_sread_woken_by_writer() {
        let cq = Arc::new(CompletionQueue::new(attr(4)).unwrap());
        let writer = {
            let cq = Arc::clone(&cq);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                cq.write(&entry(9)).unwrap();
            })
        };

        let start = Instant::now();
        let records = cq.sread(1, Some(Duration::from_secs(10))).unwrap();
        assert_eq!(contexts(&records), vec![9]);
        assert!(start.elapsed() < Duration::from_secs(5));
        writer.join().unwrap();
    }

    #[test]
    fn test_signal_interrupts_sread() {
        let cq = CompletionQueue::new(attr(4)).unwrap();
        cq.signal();
        assert_eq!(cq.sread(1, None).unwrap_err(), Error::Retry);
        // The flag is consumed
        assert_eq!(
            cq.sread(1, Some(Duration::from_millis(10))).unwrap_err(),
            Error::Retry
        );
    }

    #[test]
    fn test_single_threaded_queue() {
        let cq = CompletionQueue::single_threaded(attr(2)).unwrap();
        cq.write(&entry(1)).unwrap();
        cq.write(&entry(2)).unwrap();
        cq.write(&entry(3)).unwrap();
        assert_eq!(contexts(&cq.read(8).unwrap()), vec![1, 2, 3]);
    }
}
