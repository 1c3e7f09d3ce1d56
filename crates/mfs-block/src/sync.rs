//! Wait/wake primitives for the cache and its transports.
//!
//! The original futex-style wait queues pair a state change with a wake so
//! that a late-arriving waiter cannot miss the wake. The condvar versions
//! here preserve that property: waiters re-check their predicate under the
//! queue lock, and wakers acquire the same lock before notifying, so a
//! concurrent waiter is either still before its predicate check (and will
//! observe the new state) or already parked (and will be notified).

use parking_lot::{Condvar, Mutex};

/// A wait endpoint for an externally-tracked condition.
#[derive(Debug, Default)]
pub struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `pred()` returns true.
    ///
    /// The predicate typically reads atomics published by other threads;
    /// those publishers must call [`WaitQueue::wake_all`] after the store.
    pub fn wait_until<F>(&self, mut pred: F)
    where
        F: FnMut() -> bool,
    {
        if pred() {
            return;
        }
        let mut guard = self.lock.lock();
        while !pred() {
            self.cond.wait(&mut guard);
        }
    }

    /// Wake every waiter.
    ///
    /// Acquiring the queue lock first closes the window between a waiter's
    /// failed predicate check and its park.
    pub fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

/// A kickable signal for a dedicated worker thread.
///
/// Kicks are level-triggered: a kick delivered while the worker is busy is
/// consumed by the worker's next wait, never lost.
#[derive(Debug, Default)]
pub struct WorkSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WorkSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kick(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_one();
    }

    /// Block until kicked, consuming the pending kick.
    pub fn wait(&self) {
        let mut pending = self.pending.lock();
        while !*pending {
            self.cond.wait(&mut pending);
        }
        *pending = false;
    }
}
