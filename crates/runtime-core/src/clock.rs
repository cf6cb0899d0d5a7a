//! Clock & Timer Service (C1).
//!
//! A thin wrapper around `tokio::time` that tracks every scheduled timer in
//! a per-owner table, mirroring the teacher's per-connection task tables:
//! termination (`cancel_all` / `Drop`) is deterministic instead of relying on
//! scattered `JoinHandle`s going out of scope in unpredictable order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Opaque handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Monotonic clock plus a cancellable timer registry.
///
/// One `Clock` is owned per connector/service-host instance. Dropping it (or
/// calling `cancel_all`) aborts every outstanding timer task.
#[derive(Default)]
pub struct Clock {
    next_id: AtomicU64,
    timers: Mutex<HashMap<TimerId, JoinHandle<()>>>,
}

impl Clock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic "now", suitable only for measuring elapsed durations.
    #[must_use]
    pub fn now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn alloc_id(&self) -> TimerId {
        TimerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Run `fut` once after `delay`. The timer entry is removed from the
    /// table automatically once it fires.
    pub fn schedule_once<Fut>(&self, delay: Duration, fut: Fut) -> TimerId
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.alloc_id();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
        });
        self.timers.lock().unwrap().insert(id, handle);
        id
    }

    /// Run `f` repeatedly on a fixed period until cancelled.
    pub fn schedule_interval<F, Fut>(&self, period: Duration, mut f: F) -> TimerId
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.alloc_id();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                f().await;
            }
        });
        self.timers.lock().unwrap().insert(id, handle);
        id
    }

    /// Cancel a single timer. Returns `false` if it was unknown or already fired.
    pub fn cancel(&self, id: TimerId) -> bool {
        match self.timers.lock().unwrap().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every outstanding timer. Idempotent.
    pub fn cancel_all(&self) {
        for (_, handle) in self.timers.lock().unwrap().drain() {
            handle.abort();
        }
    }

    /// Number of currently-tracked timers (fired-but-not-yet-reaped entries
    /// are pruned lazily here).
    #[must_use]
    pub fn active_count(&self) -> usize {
        let mut timers = self.timers.lock().unwrap();
        timers.retain(|_, h| !h.is_finished());
        timers.len()
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[tokio::test]
    async fn schedule_once_runs_after_delay() {
        let clock = Clock::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        clock.schedule_once(Duration::from_millis(5), async move {
            fired2.store(true, Ordering::SeqCst);
        });
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_prevents_firing() {
        let clock = Clock::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let id = clock.schedule_once(Duration::from_millis(20), async move {
            fired2.store(true, Ordering::SeqCst);
        });
        assert!(clock.cancel(id));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn drop_cancels_outstanding_timers() {
        let fired = Arc::new(AtomicBool::new(false));
        {
            let clock = Clock::new();
            let fired2 = fired.clone();
            clock.schedule_once(Duration::from_millis(20), async move {
                fired2.store(true, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn schedule_interval_fires_repeatedly() {
        let clock = Clock::new();
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let count2 = count.clone();
        let id = clock.schedule_interval(Duration::from_millis(5), move || {
            let count3 = count2.clone();
            async move {
                count3.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        clock.cancel(id);
        assert!(count.load(Ordering::SeqCst) >= 3);
    }
}
