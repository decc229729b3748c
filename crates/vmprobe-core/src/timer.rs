//! Cancellable deadlines for polling loops.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A point in time after which a polling loop gives up, which another
/// thread may also bring forward by cancelling.
#[derive(Debug)]
pub struct Deadline {
    start: Instant,
    limit: Option<Duration>,
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl Deadline {
    /// A deadline `limit` from now.
    pub fn after(limit: Duration) -> Self {
        Self {
            start: Instant::now(),
            limit: Some(limit),
            cancelled: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    /// A deadline that only ends by [`cancel`](Self::cancel).
    pub fn never() -> Self {
        Self {
            start: Instant::now(),
            limit: None,
            cancelled: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Time since the deadline was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time left; `None` for an unbounded deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.limit.map(|l| l.saturating_sub(self.elapsed()))
    }

    /// End the deadline now and wake any waiter.
    pub fn cancel(&self) {
        *self.flag() = true;
        self.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag()
    }

    /// `true` once the limit has passed or the deadline was cancelled.
    pub fn is_over(&self) -> bool {
        self.is_cancelled() || self.remaining().is_some_and(|r| r.is_zero())
    }

    /// Sleep for up to `step`, returning early on cancellation or when
    /// the limit passes. Returns `false` if the deadline is over.
    pub fn wait(&self, step: Duration) -> bool {
        let step = match self.remaining() {
            Some(left) => step.min(left),
            None => step,
        };
        let guard = self.flag();
        if *guard {
            return false;
        }
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, step, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        let cancelled = *guard;
        drop(guard);
        !cancelled && !self.is_over()
    }
}
