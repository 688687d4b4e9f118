//! Single-shot, cancelable timers keyed to a connection and a purpose.
//!
//! Reliable delivery requires that unacknowledged segments are re-sent if no
//! ACK arrives within a bounded time, and TIME_WAIT needs a delayed teardown.
//! This module provides:
//! - [`TimerService`]: spawns one tokio sleep task per armed timer and calls
//!   back into the owning target on expiry.
//! - [`TimerHandle`]: the cancel side of one armed timer.
//! - [`Expiry`]: what the target is told when a timer fires, carrying the timer's
//!   unique id and its [`TimerPurpose`].
//!
//! The RTO is fixed (no RTT estimation, no back-off).  A cancelled timer may
//! already have fired and be queued on the target's lock; targets compare
//! [`Expiry::id`] against the handle they currently hold and treat a mismatch
//! as stale.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::AbortHandle;

/// Why a timer was armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerPurpose {
    /// Resend the outstanding segment with this sequence number.
    Retransmit(u32),
    /// Leave TIME_WAIT.
    TimeWait,
}

/// Delivered to a [`TimerTarget`] when a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    pub id: u64,
    pub purpose: TimerPurpose,
}

/// Something a timer can call back into.
pub trait TimerTarget: Send + Sync + 'static {
    fn on_timer(self: Arc<Self>, expiry: Expiry) -> impl Future<Output = ()> + Send;
}

/// Cancel side of one armed timer.
#[derive(Debug)]
pub struct TimerHandle {
    id: u64,
    task: AbortHandle,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `true` when this handle belongs to the timer that produced `expiry`.
    pub fn matches(&self, expiry: &Expiry) -> bool {
        self.id == expiry.id
    }

    /// Cancel the timer.  Idempotent; a no-op after expiry.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

/// Spawns and tracks timer tasks on the current tokio runtime.
#[derive(Debug, Default)]
pub struct TimerService {
    next_id: AtomicU64,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a single-shot timer that calls `target.on_timer` after `delay`.
    ///
    /// The target is held weakly: a timer never keeps its connection alive.
    pub fn schedule<T: TimerTarget>(
        &self,
        delay: Duration,
        target: Weak<T>,
        purpose: TimerPurpose,
    ) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let expiry = Expiry { id, purpose };
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(target) = target.upgrade() {
                target.on_timer(expiry).await;
            }
        });
        TimerHandle {
            id,
            task: task.abort_handle(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        fired: Mutex<Vec<Expiry>>,
    }

    impl TimerTarget for Recorder {
        fn on_timer(self: Arc<Self>, expiry: Expiry) -> impl Future<Output = ()> + Send {
            async move {
                self.fired.lock().unwrap().push(expiry);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let svc = TimerService::new();
        let rec = Arc::new(Recorder::default());
        let h = svc.schedule(Duration::from_millis(1000), Arc::downgrade(&rec), TimerPurpose::Retransmit(7));

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(rec.fired.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        let fired = rec.fired.lock().unwrap().clone();
        assert_eq!(fired.len(), 1);
        assert!(h.matches(&fired[0]));
        assert_eq!(fired[0].purpose, TimerPurpose::Retransmit(7));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let svc = TimerService::new();
        let rec = Arc::new(Recorder::default());
        let h = svc.schedule(Duration::from_millis(10), Arc::downgrade(&rec), TimerPurpose::TimeWait);
        h.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rec.fired.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ids_are_unique() {
        let svc = TimerService::new();
        let rec = Arc::new(Recorder::default());
        let a = svc.schedule(Duration::from_secs(1), Arc::downgrade(&rec), TimerPurpose::Retransmit(1));
        let b = svc.schedule(Duration::from_secs(1), Arc::downgrade(&rec), TimerPurpose::Retransmit(1));
        assert_ne!(a.id(), b.id());
        let expiry_a = Expiry { id: a.id(), purpose: TimerPurpose::Retransmit(1) };
        assert!(!b.matches(&expiry_a));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_target_is_not_called() {
        let svc = TimerService::new();
        let rec = Arc::new(Recorder::default());
        let weak = Arc::downgrade(&rec);
        let _h = svc.schedule(Duration::from_millis(5), weak.clone(), TimerPurpose::TimeWait);
        drop(rec);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(weak.upgrade().is_none());
    }
}
