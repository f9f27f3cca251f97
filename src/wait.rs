//! Wait object behind blocking completion-queue reads.
//!
//! Writers bump an epoch and wake every waiter. A reader captures the epoch
//! before it tries to read and then waits for it to move, so a write that
//! lands between the failed read and the wait still wakes it.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub struct WaitObject {
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl WaitObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current epoch, to be passed to [`wait_since`](Self::wait_since).
    #[inline]
    pub fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Record activity and wake all waiters.
    pub fn notify(&self) {
        let mut epoch = self.epoch.lock();
        *epoch = epoch.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Block until the epoch moves past `seen` or `timeout` elapses.
    ///
    /// Returns `true` if activity was observed, `false` on timeout. `None`
    /// waits without a deadline.
    pub fn wait_since(&self, seen: u64, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut epoch = self.epoch.lock();

        while *epoch == seen {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut epoch, deadline).timed_out() {
                        return *epoch != seen;
                    }
                }
                None => self.cond.wait(&mut epoch),
            }
        }
        true
    }
}
