//! Progress tracking for engine runs.
//!
//! Counters only; nothing here feeds back into scheduling.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

/// What is currently limiting progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum Bottleneck {
    /// Dispatching calls in parallel.
    #[default]
    Parallel,
    /// Dispatching one call at a time.
    Sequential,
    /// Waiting for a free concurrency slot.
    Slots,
    /// Waiting for the rate-limit budget to refill.
    RateLimit,
    /// Nothing left to dispatch; waiting for stragglers.
    Stragglers,
}

impl Bottleneck {
    /// Single-letter code shown in the progress line.
    #[must_use]
    pub const fn code(self) -> char {
        match self {
            Self::Parallel => 'P',
            Self::Sequential => 'S',
            Self::Slots => 'T',
            Self::RateLimit => 'L',
            Self::Stragglers => 'Z',
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Parallel => 0,
            Self::Sequential => 1,
            Self::Slots => 2,
            Self::RateLimit => 3,
            Self::Stragglers => 4,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Sequential,
            2 => Self::Slots,
            3 => Self::RateLimit,
            4 => Self::Stragglers,
            _ => Self::Parallel,
        }
    }
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Requests in the batch.
    pub total: usize,
    /// Requests answered from the cache.
    pub cached: usize,
    /// Calls in flight.
    pub running: usize,
    /// Requests resolved, cached ones included.
    pub completed: usize,
    /// Requests that ended in a terminal failure.
    pub failed: usize,
    /// Actual spend so far in USD.
    pub cost: f64,
    /// Current bottleneck.
    pub bottleneck: Bottleneck,
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:03}, failed={}, cached={}, cost=${:.2}",
            self.bottleneck.code(),
            self.running,
            self.failed,
            self.cached,
            self.cost
        )
    }
}

/// Receives progress snapshots as a run advances.
pub trait ProgressObserver: Send + Sync {
    /// Called after every state change.
    fn on_progress(&self, snapshot: &ProgressSnapshot);
}

/// Shared progress counters for one run.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    total: Arc<AtomicUsize>,
    cached: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    // micro-dollars
    cost: Arc<AtomicU64>,
    bottleneck: Arc<AtomicU8>,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker").field("snapshot", &self.snapshot()).finish_non_exhaustive()
    }
}

impl ProgressTracker {
    /// A tracker for `total` requests.
    #[must_use]
    pub fn new(total: usize) -> Self {
        let tracker = Self::default();
        tracker.total.store(total, Ordering::Relaxed);
        tracker
    }

    /// Attaches an observer notified on every change.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn notify(&self) {
        if let Some(observer) = &self.observer {
            observer.on_progress(&self.snapshot());
        }
    }

    /// Records a cache hit.
    pub fn record_cached(&self) {
        self.cached.fetch_add(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.notify();
    }

    /// Records a dispatched call.
    pub fn record_started(&self) {
        self.running.fetch_add(1, Ordering::Relaxed);
        self.notify();
    }

    /// Records a call that came back quota-exceeded and will be retried.
    pub fn record_requeued(&self) {
        decrement(&self.running);
        self.notify();
    }

    /// Records a resolved call and what it cost.
    pub fn record_finished(&self, succeeded: bool, cost: f64) {
        decrement(&self.running);
        self.completed.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        if cost > 0.0 {
            self.cost.fetch_add((cost * 1_000_000.0).round() as u64, Ordering::Relaxed);
        }
        self.notify();
    }

    /// Sets the current bottleneck, notifying only on change.
    pub fn set_bottleneck(&self, bottleneck: Bottleneck) {
        let previous = self.bottleneck.swap(bottleneck.to_u8(), Ordering::Relaxed);
        if previous != bottleneck.to_u8() {
            self.notify();
        }
    }

    /// Current values.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.load(Ordering::Relaxed),
            cached: self.cached.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cost: self.cost.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            bottleneck: Bottleneck::from_u8(self.bottleneck.load(Ordering::Relaxed)),
        }
    }
}

fn decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl ProgressObserver for Recorder {
        fn on_progress(&self, snapshot: &ProgressSnapshot) {
            self.0.lock().unwrap().push(snapshot.to_string());
        }
    }

    #[test]
    fn test_snapshot_display() {
        let snapshot = ProgressSnapshot { running: 3, cached: 1, ..ProgressSnapshot::default() };
        assert_eq!(snapshot.to_string(), "P003, failed=0, cached=1, cost=$0.00");
    }

    #[test]
    fn test_counters() {
        let tracker = ProgressTracker::new(4);
        tracker.record_cached();
        tracker.record_started();
        tracker.record_started();
        tracker.record_requeued();
        tracker.record_started();
        tracker.record_finished(true, 0.25);
        tracker.record_finished(false, 0.0);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.total, 4);
        assert_eq!(snapshot.cached, 1);
        assert_eq!(snapshot.running, 0);
        assert_eq!(snapshot.completed, 3);
        assert_eq!(snapshot.failed, 1);
        assert!((snapshot.cost - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_observer_sees_bottleneck_changes_once() {
        let recorder = Arc::new(Recorder::default());
        let tracker = ProgressTracker::new(1).with_observer(recorder.clone());
        tracker.set_bottleneck(Bottleneck::RateLimit);
        tracker.set_bottleneck(Bottleneck::RateLimit);
        tracker.set_bottleneck(Bottleneck::Stragglers);

        let lines = recorder.0.lock().unwrap();
        assert_eq!(lines.as_slice(), ["L000, failed=0, cached=0, cost=$0.00", "Z000, failed=0, cached=0, cost=$0.00"]);
    }

    #[test]
    fn test_running_never_underflows() {
        let tracker = ProgressTracker::new(1);
        tracker.record_requeued();
        assert_eq!(tracker.snapshot().running, 0);
    }
}
