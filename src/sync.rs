//! Lock used by completion queues whose every producer and consumer runs on
//! one thread.
//!
//! `SingleThreadRawMutex` is a plain `Cell<bool>`: no atomics, no parking.
//! It is `!Sync`, so a `CompletionQueue<SingleThreadRawMutex>` cannot be
//! shared across threads at all, and the compiler enforces the contract that
//! makes skipping real locking legal. Re-locking while held is a bug and
//! panics, the same way `RefCell` does.

use std::cell::Cell;

use parking_lot::lock_api::{GuardNoSend, RawMutex};

pub struct SingleThreadRawMutex {
    locked: Cell<bool>,
}

unsafe impl RawMutex for SingleThreadRawMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = SingleThreadRawMutex {
        locked: Cell::new(false),
    };

    type GuardMarker = GuardNoSend;

    fn lock(&self) {
        if self.locked.replace(true) {
            panic!("single-threaded completion queue locked re-entrantly");
        }
    }

    fn try_lock(&self) -> bool {
        !self.locked.replace(true)
    }

    unsafe fn unlock(&self) {
        self.locked.set(false);
    }

    fn is_locked(&self) -> bool {
        self.locked.get()
    }
}
