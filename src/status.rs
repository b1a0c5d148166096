//! Status Tracker.
//!
//! Process-wide counters plus a per-test status map: six independent
//! `AtomicI64` counters plus a lock-protected status map.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use tracing::warn;

use crate::model::{AllocationStatus, StatusSnapshot, TestId};
use crate::persistence::Persistence;

/// Concurrency-safe counters and per-test status store.
pub struct StatusTracker {
    active: AtomicI64,
    queued: AtomicI64,
    completed: AtomicI64,
    failed: AtomicI64,
    cancelled: AtomicI64,
    timed_out: AtomicI64,
    per_test: Mutex<HashMap<TestId, AllocationStatus>>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            active: AtomicI64::new(0),
            queued: AtomicI64::new(0),
            completed: AtomicI64::new(0),
            failed: AtomicI64::new(0),
            cancelled: AtomicI64::new(0),
            timed_out: AtomicI64::new(0),
            per_test: Mutex::new(HashMap::new()),
        }
    }

    pub fn increment_active(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_active(&self) {
        // Invariant: active_count >= 0 at all times.
        let prev = self.active.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "active_count went negative");
    }

    pub fn mark_queued(&self, test_id: &str) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.set_status_in_memory(test_id, AllocationStatus::Pending);
    }

    /// A request has left PENDING, either to be allocated or because it
    /// was cancelled while still queued. queued+active+terminal counters
    /// must sum to the accepted-submission count at every observed
    /// snapshot.
    pub fn decrement_queued(&self) {
        let prev = self.queued.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "queued_count went negative");
    }

    fn set_status_in_memory(&self, test_id: &str, status: AllocationStatus) -> bool {
        let mut map = self.per_test.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = map.get(test_id)
            && existing.is_terminal()
        {
            // Last-writer-wins, but terminal statuses never regress.
            return false;
        }
        map.insert(test_id.to_string(), status);
        true
    }

    /// Sets the status for a test, appending a durable event to the
    /// persistence store before returning, so a crash right after this
    /// call never loses the transition it recorded.
    pub async fn set_status(&self, persistence: &Persistence, test_id: &str, status: AllocationStatus) {
        if !self.set_status_in_memory(test_id, status.clone()) {
            return;
        }
        match status {
            AllocationStatus::Completed => self.completed.fetch_add(1, Ordering::SeqCst),
            AllocationStatus::Failed => self.failed.fetch_add(1, Ordering::SeqCst),
            AllocationStatus::Cancelled => self.cancelled.fetch_add(1, Ordering::SeqCst),
            AllocationStatus::TimedOut => self.timed_out.fetch_add(1, Ordering::SeqCst),
            _ => 0,
        };
        // Queued/active bookkeeping is handled by the dispatcher's explicit
        // increment/decrement calls around run_started, not here.
        if let Err(e) = persistence
            .append_status_change(test_id, status)
            .await
        {
            // Not durable: the scheduler treats this transition as
            // non-durable for recovery accounting.
            warn!("status change for {test_id} failed to persist durably: {e}");
        }
    }

    /// Restores a terminal status learned from the persisted result
    /// snapshot during recovery, without touching queued/active counters:
    /// the test was never counted as queued or active this process
    /// lifetime.
    pub fn restore_terminal(&self, test_id: &str, status: AllocationStatus) {
        debug_assert!(status.is_terminal());
        if !self.set_status_in_memory(test_id, status.clone()) {
            return;
        }
        match status {
            AllocationStatus::Completed => self.completed.fetch_add(1, Ordering::SeqCst),
            AllocationStatus::Failed => self.failed.fetch_add(1, Ordering::SeqCst),
            AllocationStatus::Cancelled => self.cancelled.fetch_add(1, Ordering::SeqCst),
            AllocationStatus::TimedOut => self.timed_out.fetch_add(1, Ordering::SeqCst),
            _ => 0,
        };
    }

    /// Non-blocking read; counters may be individually inconsistent with
    /// each other across concurrent updates.
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            active_count: self.active.load(Ordering::SeqCst),
            queued_count: self.queued.load(Ordering::SeqCst),
            completed_count: self.completed.load(Ordering::SeqCst),
            failed_count: self.failed.load(Ordering::SeqCst),
            cancelled_count: self.cancelled.load(Ordering::SeqCst),
            timed_out_count: self.timed_out.load(Ordering::SeqCst),
            per_test_status: self
                .per_test
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    pub fn status_of(&self, test_id: &str) -> Option<AllocationStatus> {
        self.per_test
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(test_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn persistence(dir: &TempDir) -> Persistence {
        Persistence::new(dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn active_count_never_goes_negative_in_balanced_use() {
        let tracker = StatusTracker::new();
        tracker.increment_active();
        tracker.decrement_active();
        assert_eq!(tracker.snapshot().active_count, 0);
    }

    #[tokio::test]
    async fn terminal_status_does_not_regress() {
        let dir = TempDir::new().unwrap();
        let p = persistence(&dir);
        let tracker = StatusTracker::new();
        tracker.mark_queued("t1");
        tracker.set_status(&p, "t1", AllocationStatus::Completed).await;
        tracker.set_status(&p, "t1", AllocationStatus::Failed).await;
        assert_eq!(tracker.status_of("t1"), Some(AllocationStatus::Completed));
    }

    #[tokio::test]
    async fn conservation_holds_across_terminal_counters() {
        let dir = TempDir::new().unwrap();
        let p = persistence(&dir);
        let tracker = StatusTracker::new();
        for id in ["a", "b", "c"] {
            tracker.mark_queued(id);
        }
        tracker.set_status(&p, "a", AllocationStatus::Completed).await;
        tracker.set_status(&p, "b", AllocationStatus::Failed).await;
        let snap = tracker.snapshot();
        assert_eq!(snap.completed_count + snap.failed_count, 2);
        assert_eq!(snap.per_test_status.len(), 3);
    }
}
