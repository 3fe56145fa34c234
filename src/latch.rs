//! Per-slot lock/wait primitive.
//!
//! The contract is "wait for the flag to clear, then atomically claim it":
//! two contenders must never both observe the flag clear and both claim.
//! Built on a mutex plus condition variable so it stays correct under real
//! preemption, not just cooperative scheduling. No fairness is promised
//! among waiters.

use parking_lot::{Condvar, Mutex};

/// A claimable busy flag with a wait queue.
///
/// Unlike a plain mutex, the holder is a logical task, not a lexical scope:
/// a latch can be claimed, carried across blocking calls, and released on a
/// different code path. Release on every exit path is the holder's burden.
#[derive(Debug, Default)]
pub struct Latch {
    held: Mutex<bool>,
    cleared: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the latch is clear, then claim it.
    pub fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            self.cleared.wait(&mut held);
        }
        *held = true;
    }

    /// Clear the latch and wake every waiter.
    pub fn release(&self) {
        let mut held = self.held.lock();
        *held = false;
        drop(held);
        self.cleared.notify_all();
    }

    /// Block until the latch is clear without claiming it.
    ///
    /// Used before reading fields another task may be mid-way through
    /// rewriting; the caller must re-validate what it read, since the latch
    /// may be claimed again the instant this returns.
    pub fn wait_clear(&self) {
        let mut held = self.held.lock();
        while *held {
            self.cleared.wait(&mut held);
        }
    }

    /// Advisory peek at the flag; stale by the time the caller acts on it.
    pub fn is_held(&self) -> bool {
        *self.held.lock()
    }

    /// Wake every waiter without touching the flag.
    pub fn notify(&self) {
        self.cleared.notify_all();
    }
}
