//! Completion tracking for the worker pipeline.

use prometheus::IntGauge;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Counts tasks that have been created but not yet finished.
///
/// Every producer calls [`begin`](Self::begin) before handing a task to a
/// queue and every consumer calls [`finish`](Self::finish) once the task is
/// terminal. A re-enqueued task begins again before the original finishes,
/// so the count never touches zero while work remains.
#[derive(Debug)]
pub struct CompletionTracker {
    in_flight: AtomicI64,
    started: Instant,
    last_activity_ms: AtomicU64,
    gauge: Option<IntGauge>,
}

impl Default for CompletionTracker {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CompletionTracker {
    pub fn new(gauge: Option<IntGauge>) -> Self {
        Self {
            in_flight: AtomicI64::new(0),
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            gauge,
        }
    }

    pub fn begin(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.publish(now);
        self.touch();
    }

    pub fn finish(&self) {
        let now = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        if now < 0 {
            tracing::error!(in_flight = now, "Completion tracker went negative");
        }
        self.publish(now);
        self.touch();
    }

    /// Record activity without changing the count.
    pub fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Time since the last begin, finish or touch.
    pub fn idle_for(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::SeqCst);
        Duration::from_millis(now.saturating_sub(last))
    }

    fn publish(&self, value: i64) {
        if let Some(gauge) = &self.gauge {
            gauge.set(value);
        }
    }

    /// Poll until nothing is in flight and nothing has happened for `quiet`.
    ///
    /// Returns false if `cancel` fired first.
    pub async fn wait_quiescent(
        &self,
        poll: Duration,
        quiet: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            if self.in_flight() <= 0 && self.idle_for() >= quiet {
                return true;
            }
            tracing::debug!(in_flight = self.in_flight(), "Waiting for pipeline to drain");
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}

/// Outstanding objects from one listing page.
#[derive(Debug)]
pub struct PageCounter {
    bucket: String,
    page: usize,
    remaining: AtomicUsize,
}

impl PageCounter {
    pub fn new(bucket: impl Into<String>, page: usize) -> Self {
        Self {
            bucket: bucket.into(),
            page,
            remaining: AtomicUsize::new(0),
        }
    }

    pub fn add(&self) {
        self.remaining.fetch_add(1, Ordering::SeqCst);
    }

    /// Mark one object finished. Returns true when it was the page's last.
    pub fn done(&self) -> bool {
        let before = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        let drained = before == 1;
        if drained {
            tracing::debug!(bucket = %self.bucket, page = self.page, "Listing page finished");
        }
        drained
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_with_requeue() {
        let tracker = CompletionTracker::default();
        tracker.begin();
        // Re-enqueue: the replacement begins before the original finishes.
        tracker.begin();
        tracker.finish();
        assert_eq!(tracker.in_flight(), 1);
        tracker.finish();
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn test_gauge_follows_count() {
        let gauge = IntGauge::new("test_in_flight", "test").unwrap();
        let tracker = CompletionTracker::new(Some(gauge.clone()));
        tracker.begin();
        tracker.begin();
        assert_eq!(gauge.get(), 2);
        tracker.finish();
        assert_eq!(gauge.get(), 1);
    }

    #[tokio::test]
    async fn test_wait_quiescent_returns_after_drain() {
        let tracker = std::sync::Arc::new(CompletionTracker::default());
        let cancel = CancellationToken::new();
        tracker.begin();

        let worker = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                tracker.finish();
            })
        };

        let drained = tracker
            .wait_quiescent(Duration::from_millis(5), Duration::ZERO, &cancel)
            .await;
        assert!(drained);
        assert_eq!(tracker.in_flight(), 0);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_quiescent_stops_on_cancel() {
        let tracker = CompletionTracker::default();
        let cancel = CancellationToken::new();
        tracker.begin();
        cancel.cancel();
        let drained = tracker
            .wait_quiescent(Duration::from_millis(5), Duration::ZERO, &cancel)
            .await;
        assert!(!drained);
    }

    #[test]
    fn test_page_counter_reports_last_object() {
        let page = PageCounter::new("bucket", 0);
        page.add();
        page.add();
        assert!(!page.done());
        assert!(page.done());
        assert_eq!(page.remaining(), 0);
        // Extra calls saturate instead of wrapping.
        assert!(!page.done());
    }
}
