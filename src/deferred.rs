//! Persistent FIFO queue of downloads postponed to a later wall-clock time.
//!
//! Works land here when a provider's quota is exhausted and its policy says
//! to wait for the reset rather than fall back. A periodic ticker in the
//! scheduler asks for ready items and replays them. Items keep their full
//! candidate and fallback snapshots so a replay continues exactly where the
//! original attempt stopped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::TaskContext;
use crate::model::ScoredCandidate;

/// Days a completed or failed item stays in the queue before compaction.
const TERMINAL_RETENTION_DAYS: i64 = 7;

/// Why a task was deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    Quota,
    Rate,
    Transient,
}

/// Lifecycle state of a deferred item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredStatus {
    Pending,
    Retrying,
    Completed,
    Failed,
}

impl DeferredStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One postponed download with everything needed to replay it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredItem {
    pub id: String,
    pub context: TaskContext,
    pub title: String,
    pub candidate: ScoredCandidate,
    /// Remaining fallback candidates, in selection order.
    #[serde(default)]
    pub fallbacks: Vec<ScoredCandidate>,
    pub reason: DeferReason,
    pub ready_at: DateTime<Utc>,
    pub attempt_index: u32,
    pub created_at: DateTime<Utc>,
    pub status: DeferredStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DeferredItem {
    fn is_ready(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, DeferredStatus::Pending | DeferredStatus::Retrying)
            && self.ready_at <= now
    }
}

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_item_id(work_id: &str, provider_key: &str) -> String {
    let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{work_id}-{provider_key}-{seq}")
}

/// Internally synchronized FIFO queue of [`DeferredItem`]s.
#[derive(Debug)]
pub struct DeferredQueue {
    items: Mutex<Vec<DeferredItem>>,
    max_retries: u32,
}

impl DeferredQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            max_retries: max_retries.max(1),
        }
    }

    /// Enqueues a deferred download, deduplicating on an already-pending
    /// item for the same work and provider. Returns the item id.
    pub fn defer(
        &self,
        context: TaskContext,
        title: impl Into<String>,
        candidate: ScoredCandidate,
        fallbacks: Vec<ScoredCandidate>,
        reason: DeferReason,
        ready_at: DateTime<Utc>,
    ) -> String {
        let title = title.into();
        let mut items = self.lock();

        if let Some(existing) = items.iter_mut().find(|item| {
            item.status == DeferredStatus::Pending
                && item.context.work_id == context.work_id
                && item.candidate.candidate.provider_key == candidate.candidate.provider_key
        }) {
            // Keep the later reset estimate.
            if ready_at > existing.ready_at {
                existing.ready_at = ready_at;
            }
            debug!(id = %existing.id, "work already deferred for this provider");
            return existing.id.clone();
        }

        let item = DeferredItem {
            id: next_item_id(&context.work_id, &candidate.candidate.provider_key),
            context,
            title: title.clone(),
            candidate,
            fallbacks,
            reason,
            ready_at,
            attempt_index: 0,
            created_at: Utc::now(),
            status: DeferredStatus::Pending,
            error_message: None,
        };
        let id = item.id.clone();
        info!(
            id = %id,
            title = %title,
            ready_at = %ready_at,
            ?reason,
            "deferred download queued"
        );
        items.push(item);
        id
    }

    /// Removes and returns up to `capacity` items whose `ready_at` has
    /// passed, preserving FIFO order. Items past the retry budget are
    /// marked failed instead of returned.
    pub fn take_ready(&self, now: DateTime<Utc>, capacity: usize) -> Vec<DeferredItem> {
        let mut taken = Vec::new();
        let mut items = self.lock();
        for item in items.iter_mut() {
            if taken.len() >= capacity {
                break;
            }
            if !item.is_ready(now) {
                continue;
            }
            if item.attempt_index >= self.max_retries {
                item.status = DeferredStatus::Failed;
                item.error_message =
                    Some(format!("retry budget ({}) exhausted", self.max_retries));
                warn!(id = %item.id, title = %item.title, "deferred item out of retries");
                continue;
            }
            item.status = DeferredStatus::Retrying;
            item.attempt_index += 1;
            taken.push(item.clone());
        }
        taken
    }

    /// Marks an item completed.
    pub fn mark_completed(&self, id: &str) {
        self.mark(id, DeferredStatus::Completed, None);
    }

    /// Marks an item permanently failed.
    pub fn mark_failed(&self, id: &str, error: impl Into<String>) {
        self.mark(id, DeferredStatus::Failed, Some(error.into()));
    }

    /// Pushes an item's retry back to a new ready time (quota hit again).
    pub fn re_defer(&self, id: &str, ready_at: DateTime<Utc>) {
        let mut items = self.lock();
        if let Some(item) = items.iter_mut().find(|item| item.id == id) {
            item.status = DeferredStatus::Pending;
            item.ready_at = ready_at;
        }
    }

    fn mark(&self, id: &str, status: DeferredStatus, error: Option<String>) {
        let mut items = self.lock();
        if let Some(item) = items.iter_mut().find(|item| item.id == id) {
            item.status = status;
            item.error_message = error;
        }
    }

    /// Earliest ready time among live items, for ticker scheduling.
    #[must_use]
    pub fn next_ready_at(&self) -> Option<DateTime<Utc>> {
        self.lock()
            .iter()
            .filter(|item| !item.status.is_terminal())
            .map(|item| item.ready_at)
            .min()
    }

    /// Number of items whose status is pending or retrying.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|item| !item.status.is_terminal())
            .count()
    }

    /// Removes terminal items older than the retention window. Returns the
    /// number removed.
    pub fn compact(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - ChronoDuration::days(TERMINAL_RETENTION_DAYS);
        let mut items = self.lock();
        let before = items.len();
        items.retain(|item| !(item.status.is_terminal() && item.created_at < cutoff));
        let removed = before - items.len();
        if removed > 0 {
            info!(removed, "compacted deferred queue");
        }
        removed
    }

    /// Ordered snapshot for persistence.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DeferredItem> {
        self.lock().clone()
    }

    /// Replaces queue contents with a persisted snapshot, preserving
    /// order, then compacts stale terminal items.
    pub fn restore(&self, snapshot: Vec<DeferredItem>) {
        {
            let mut items = self.lock();
            *items = snapshot;
            // In-flight markers from a previous run go back to pending.
            for item in items.iter_mut() {
                if item.status == DeferredStatus::Retrying {
                    item.status = DeferredStatus::Pending;
                }
            }
        }
        let live = self.live_count();
        if live > 0 {
            info!(live, "restored deferred queue");
        }
        self.compact(Utc::now());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DeferredItem>> {
        match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{Candidate, Scores};
    use std::path::PathBuf;

    fn scored(provider: &str, source: &str) -> ScoredCandidate {
        ScoredCandidate {
            candidate: Candidate::new(provider, provider.to_uppercase(), "The Raven", source),
            scores: Scores {
                title_score: 100,
                creator_score: 100,
                quality_bonus: 0.0,
                total: 100.0,
            },
        }
    }

    fn context(work_id: &str, provider: &str) -> TaskContext {
        TaskContext {
            work_id: work_id.to_string(),
            entry_id: "E1".to_string(),
            provider_key: provider.to_string(),
            name_stem: "e1_the_raven".to_string(),
            work_dir: PathBuf::from("/out/e1_the_raven"),
        }
    }

    #[test]
    fn test_defer_and_take_ready_fifo() {
        let queue = DeferredQueue::new(5);
        let past = Utc::now() - ChronoDuration::hours(1);
        queue.defer(context("w1", "annas"), "first", scored("annas", "a"), vec![], DeferReason::Quota, past);
        queue.defer(context("w2", "annas"), "second", scored("annas", "b"), vec![], DeferReason::Quota, past);

        let ready = queue.take_ready(Utc::now(), 10);
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].title, "first");
        assert_eq!(ready[1].title, "second");
        assert_eq!(ready[0].attempt_index, 1);
    }

    #[test]
    fn test_take_ready_respects_ready_at_and_capacity() {
        let queue = DeferredQueue::new(5);
        let past = Utc::now() - ChronoDuration::hours(1);
        let future = Utc::now() + ChronoDuration::hours(1);
        queue.defer(context("w1", "annas"), "ready", scored("annas", "a"), vec![], DeferReason::Quota, past);
        queue.defer(context("w2", "annas"), "not yet", scored("annas", "b"), vec![], DeferReason::Quota, future);
        queue.defer(context("w3", "annas"), "ready too", scored("annas", "c"), vec![], DeferReason::Quota, past);

        let ready = queue.take_ready(Utc::now(), 1);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].title, "ready");
        assert_eq!(queue.live_count(), 3);
    }

    #[test]
    fn test_dedupe_same_work_and_provider() {
        let queue = DeferredQueue::new(5);
        let early = Utc::now() + ChronoDuration::hours(1);
        let late = Utc::now() + ChronoDuration::hours(5);
        let a = queue.defer(context("w1", "annas"), "t", scored("annas", "a"), vec![], DeferReason::Quota, early);
        let b = queue.defer(context("w1", "annas"), "t", scored("annas", "a"), vec![], DeferReason::Quota, late);
        assert_eq!(a, b);
        assert_eq!(queue.snapshot().len(), 1);
        assert_eq!(queue.snapshot()[0].ready_at, late);
    }

    #[test]
    fn test_retry_budget_marks_failed() {
        let queue = DeferredQueue::new(1);
        let past = Utc::now() - ChronoDuration::hours(1);
        let id = queue.defer(context("w1", "annas"), "t", scored("annas", "a"), vec![], DeferReason::Quota, past);

        let first = queue.take_ready(Utc::now(), 10);
        assert_eq!(first.len(), 1);
        queue.re_defer(&id, past);

        // Second round exceeds max_retries = 1.
        let second = queue.take_ready(Utc::now(), 10);
        assert!(second.is_empty());
        let snapshot = queue.snapshot();
        assert_eq!(snapshot[0].status, DeferredStatus::Failed);
    }

    #[test]
    fn test_compact_removes_old_terminal_only() {
        let queue = DeferredQueue::new(5);
        let past = Utc::now() - ChronoDuration::hours(1);
        let id = queue.defer(context("w1", "annas"), "old done", scored("annas", "a"), vec![], DeferReason::Quota, past);
        queue.defer(context("w2", "annas"), "live", scored("annas", "b"), vec![], DeferReason::Quota, past);
        queue.mark_completed(&id);

        // Nothing is old enough yet.
        assert_eq!(queue.compact(Utc::now()), 0);
        // Ten days later the completed item goes away, the live one stays.
        assert_eq!(queue.compact(Utc::now() + ChronoDuration::days(10)), 1);
        assert_eq!(queue.snapshot().len(), 1);
        assert_eq!(queue.snapshot()[0].title, "live");
    }

    #[test]
    fn test_snapshot_restore_preserves_order() {
        let queue = DeferredQueue::new(5);
        let at = Utc::now() - ChronoDuration::hours(1);
        for n in 0..4 {
            queue.defer(
                context(&format!("w{n}"), "annas"),
                format!("item {n}"),
                scored("annas", &format!("s{n}")),
                vec![],
                DeferReason::Quota,
                at,
            );
        }
        let snapshot = queue.snapshot();

        let restored = DeferredQueue::new(5);
        restored.restore(snapshot);
        let titles: Vec<String> = restored
            .take_ready(Utc::now(), 10)
            .into_iter()
            .map(|item| item.title)
            .collect();
        assert_eq!(titles, vec!["item 0", "item 1", "item 2", "item 3"]);
    }

    #[test]
    fn test_restore_resets_stale_retrying() {
        let queue = DeferredQueue::new(5);
        let at = Utc::now() - ChronoDuration::hours(1);
        queue.defer(context("w1", "annas"), "t", scored("annas", "a"), vec![], DeferReason::Quota, at);
        let taken = queue.take_ready(Utc::now(), 10);
        assert_eq!(taken[0].status, DeferredStatus::Retrying);

        let restored = DeferredQueue::new(5);
        restored.restore(queue.snapshot());
        assert_eq!(restored.snapshot()[0].status, DeferredStatus::Pending);
    }

    #[test]
    fn test_json_round_trip() {
        let queue = DeferredQueue::new(5);
        let at = Utc::now();
        queue.defer(
            context("w1", "annas"),
            "t",
            scored("annas", "a"),
            vec![scored("ia", "b")],
            DeferReason::Quota,
            at,
        );
        let json = serde_json::to_string(&queue.snapshot()).unwrap();
        let back: Vec<DeferredItem> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].fallbacks.len(), 1);
        assert_eq!(back[0].reason, DeferReason::Quota);
    }
}
