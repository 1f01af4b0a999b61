//! Debounce and throttle primitives.
//!
//! Both keep their scheduling state behind a short-lived mutex that is never
//! held across an await point, so concurrent callers see atomic decisions.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // State is a plain handle or timestamp; a panic elsewhere cannot leave it half-written.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Coalesces bursts of calls into one, fired after a quiet period.
///
/// Each [`schedule`](Debouncer::schedule) cancels whatever was pending and
/// restarts the timer, so only the most recent operation runs.
pub struct Debouncer {
    interval: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Schedule `op` to run once the interval passes without another call.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&self, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let interval = self.interval;
        let mut pending = lock(&self.pending);
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            op().await;
        }));
    }

    /// Drop the pending operation, if any.
    pub fn cancel(&self) {
        if let Some(previous) = lock(&self.pending).take() {
            previous.abort();
        }
    }

    /// Whether an operation is waiting or running.
    pub fn is_pending(&self) -> bool {
        lock(&self.pending)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Runs an operation at most once per interval, dropping excess calls.
pub struct Throttle {
    interval: Duration,
    last_run: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_run: Mutex::new(None),
        }
    }

    /// Run `op` now if at least the interval has elapsed since the last run.
    ///
    /// Returns `None` without queueing anything when the call is throttled.
    pub fn run_if_due<R>(&self, op: impl FnOnce() -> R) -> Option<R> {
        if !self.claim() {
            return None;
        }
        Some(op())
    }

    /// Record a run now if one is due. Used when the operation itself is async.
    pub fn claim(&self) -> bool {
        let now = Instant::now();
        let mut last_run = lock(&self.last_run);
        if let Some(previous) = *last_run {
            if now.duration_since(previous) < self.interval {
                return false;
            }
        }
        *last_run = Some(now);
        true
    }

    /// Forget the last run so the next call executes immediately.
    pub fn reset(&self) {
        *lock(&self.last_run) = None;
    }
}
