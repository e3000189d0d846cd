//! Concurrent download scheduler.
//!
//! A bounded pool of `max_parallel_downloads` workers executes download
//! chains. One chain covers one work: the primary candidate first, then
//! each fallback in selection order, so attempts within a work are
//! strictly ordered while works overlap freely.
//!
//! Admission to a provider is additionally gated by that provider's
//! concurrency semaphore. The global pool slot is held while waiting on
//! the provider slot; operators size `max_parallel_downloads` accordingly
//! or accept head-of-line blocking.
//!
//! The scheduler owns post-download finalization: terminal status into
//! `work.json`, the `index.csv` row, the input-CSV status column, and
//! deferred-queue bookkeeping.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::context::TaskContext;
use crate::deferred::{DeferReason, DeferredQueue};
use crate::input::InputCsv;
use crate::journal::{IndexRow, WorkJournal};
use crate::model::{InputRecord, ScoredCandidate, Selection, Work, WorkStatus};
use crate::naming::ArtifactNamer;
use crate::net::{FetchError, HttpExecutor, PARTIAL_SUFFIX};
use crate::provider::{DownloadOptions, ProviderRegistry};
use crate::quota::{QuotaDecision, QuotaLedger};
use crate::shutdown::ShutdownHandle;
use crate::state::StateStore;

/// One unit of scheduler work: the current candidate of a work's chain
/// plus the fallbacks still available to it.
#[derive(Debug)]
pub struct DownloadTask {
    pub work: Work,
    pub candidate: ScoredCandidate,
    pub fallbacks: VecDeque<ScoredCandidate>,
    /// 0 for the primary; bumped on every fallback and deferred replay.
    pub attempt_index: u32,
    /// Set when this task replays a deferred-queue item.
    pub deferred_id: Option<String>,
}

impl DownloadTask {
    /// Builds the initial task for a fresh selection.
    #[must_use]
    pub fn from_selection(work: Work, selection: Selection) -> Self {
        Self {
            work,
            candidate: selection.primary,
            fallbacks: selection.fallbacks.into(),
            attempt_index: 0,
            deferred_id: None,
        }
    }
}

/// Shared services the scheduler operates on, wired once by the
/// composition root.
pub struct SchedulerServices {
    pub config: Config,
    pub executor: Arc<HttpExecutor>,
    pub registry: Arc<ProviderRegistry>,
    pub quota: Arc<QuotaLedger>,
    pub deferred: Arc<DeferredQueue>,
    pub state: Arc<StateStore>,
    pub journal: Arc<WorkJournal>,
    /// Absent in runs not driven by a CSV (tests, replays of orphans).
    pub input_csv: Option<Arc<InputCsv>>,
    pub shutdown: ShutdownHandle,
}

/// Terminal counters for the run summary.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    deferred: AtomicUsize,
}

impl SchedulerStats {
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn deferred(&self) -> usize {
        self.deferred.load(Ordering::SeqCst)
    }
}

struct Inner {
    services: SchedulerServices,
    pool: Arc<Semaphore>,
    provider_slots: DashMap<String, Arc<Semaphore>>,
    pending: AtomicUsize,
    idle: Notify,
    stats: SchedulerStats,
}

impl Inner {
    fn provider_slot(&self, provider_key: &str) -> Arc<Semaphore> {
        self.provider_slots
            .entry(provider_key.to_string())
            .or_insert_with(|| {
                let limit = self.services.config.download.provider_concurrency(provider_key);
                debug!(provider = provider_key, limit, "creating provider slot");
                Arc::new(Semaphore::new(limit))
            })
            .clone()
    }

    fn task_done(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.idle.notify_waiters();
    }
}

/// The bounded worker pool.
pub struct DownloadScheduler {
    inner: Arc<Inner>,
}

impl DownloadScheduler {
    /// Creates a scheduler over the shared services.
    #[must_use]
    pub fn new(services: SchedulerServices) -> Self {
        let pool_size = services.config.download.max_parallel_downloads.max(1);
        info!(
            workers = pool_size,
            worker_timeout_s = services.config.download.worker_timeout_s,
            "download scheduler ready"
        );
        Self {
            inner: Arc::new(Inner {
                pool: Arc::new(Semaphore::new(pool_size)),
                provider_slots: DashMap::new(),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                stats: SchedulerStats::default(),
                services,
            }),
        }
    }

    /// Terminal counters.
    #[must_use]
    pub fn stats(&self) -> &SchedulerStats {
        &self.inner.stats
    }

    /// Number of chains submitted but not yet finished.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Enqueues a work's download chain.
    ///
    /// Ownership of the work transfers to the scheduler until the chain
    /// reaches a terminal status. Rejected (dropped) when shutdown has
    /// been requested.
    pub fn submit(&self, work: Work, selection: Selection) {
        if self.inner.services.shutdown.is_requested() {
            warn!(work_id = %work.work_id, "scheduler draining; rejecting task");
            return;
        }
        Self::spawn_chain(
            Arc::clone(&self.inner),
            DownloadTask::from_selection(work, selection),
        );
    }

    fn spawn_chain(inner: Arc<Inner>, task: DownloadTask) -> JoinHandle<()> {
        inner.pending.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            run_chain(Arc::clone(&inner), task).await;
            inner.task_done();
        })
    }

    /// Waits until every submitted chain has finished.
    pub async fn wait_idle(&self) {
        loop {
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.inner.idle.notified();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Re-enqueues deferred items whose ready time has passed.
    ///
    /// Returns the number of chains spawned. Used by the background
    /// ticker and callable directly (tests, forced replays).
    pub fn replay_ready(&self, now: chrono::DateTime<Utc>) -> usize {
        let inner = &self.inner;
        let capacity = inner
            .services
            .config
            .download
            .max_parallel_downloads
            .max(1);
        let ready = inner.services.deferred.take_ready(now, capacity);
        let count = ready.len();
        for item in ready {
            info!(
                id = %item.id,
                title = %item.title,
                attempt = item.attempt_index,
                "replaying deferred download"
            );
            let work = inner
                .services
                .journal
                .read_work(&item.context.work_dir)
                .unwrap_or_else(|| {
                    // The journal entry is gone; rebuild a minimal work so
                    // the replay can still be recorded.
                    Work::new(
                        InputRecord::new(item.context.entry_id.clone(), item.title.clone()),
                        item.context.work_dir.clone(),
                    )
                });
            Self::spawn_chain(
                Arc::clone(inner),
                DownloadTask {
                    work,
                    candidate: item.candidate.clone(),
                    fallbacks: item.fallbacks.clone().into(),
                    attempt_index: item.attempt_index,
                    deferred_id: Some(item.id.clone()),
                },
            );
        }
        count
    }

    /// Spawns the periodic deferred-queue ticker. Stops on shutdown.
    pub fn spawn_deferred_ticker(&self) -> JoinHandle<()> {
        let scheduler = Self {
            inner: Arc::clone(&self.inner),
        };
        let interval =
            Duration::from_secs(self.inner.services.config.deferred.check_interval_s.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = scheduler.inner.services.shutdown.wait() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                let replayed = scheduler.replay_ready(Utc::now());
                if replayed > 0 {
                    debug!(replayed, "deferred ticker dispatched items");
                }
            }
            debug!("deferred ticker stopped");
        })
    }

    /// Persists the quota ledger and deferred queue together.
    pub fn flush_state(&self) {
        let services = &self.inner.services;
        if let Err(error) = services.state.flush(&services.quota, &services.deferred) {
            warn!(%error, "failed to persist state file");
        }
    }
}

/// Runs one work's candidate chain to a terminal status.
#[instrument(skip_all, fields(work_id = %task.work.work_id, entry_id = %task.work.input.entry_id))]
async fn run_chain(inner: Arc<Inner>, task: DownloadTask) {
    let services = &inner.services;
    let DownloadTask {
        mut work,
        candidate: mut current,
        mut fallbacks,
        mut attempt_index,
        deferred_id,
    } = task;

    let Ok(_pool_permit) = Arc::clone(&inner.pool).acquire_owned().await else {
        return;
    };
    if services.shutdown.is_requested() {
        debug!("shutdown before start; leaving work pending");
        return;
    }

    let stem = services.journal.stem_for(&work.input);
    let mut namer = ArtifactNamer::new(stem);
    let mut failure_kinds: Vec<String> = Vec::new();

    loop {
        if services.shutdown.is_requested() {
            debug!("shutdown mid-chain; leaving work pending");
            return;
        }

        let provider = current.candidate.provider_key.clone();
        let ctx = TaskContext {
            work_id: work.work_id.clone(),
            entry_id: work.input.entry_id.clone(),
            provider_key: provider.clone(),
            name_stem: namer.stem().to_string(),
            work_dir: work.work_dir.clone(),
        };

        // Quota gate before any network traffic.
        match services.quota.check(&provider) {
            QuotaDecision::Exhausted {
                ready_at,
                wait_for_reset: true,
            } => {
                info!(provider = %provider, ready_at = %ready_at, "quota exhausted; deferring");
                match &deferred_id {
                    Some(id) => services.deferred.re_defer(id, ready_at),
                    None => {
                        services.deferred.defer(
                            ctx,
                            work.input.title.clone(),
                            current.clone(),
                            fallbacks.iter().cloned().collect(),
                            DeferReason::Quota,
                            ready_at,
                        );
                    }
                }
                work.transition(
                    WorkStatus::Deferred,
                    format!("{provider}:deferred:quota-exhausted"),
                );
                if let Err(e) = services.journal.write_work(&work) {
                    error!(error = %e, "failed to persist deferred work");
                }
                inner.stats.deferred.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = services.state.flush(&services.quota, &services.deferred) {
                    warn!(error = %e, "failed to persist state after deferral");
                }
                return;
            }
            QuotaDecision::Exhausted { .. } => {
                warn!(provider = %provider, "quota exhausted; falling back");
                work.record_event(format!("{provider}:failed:quota-exhausted"));
                failure_kinds.push("quota-exhausted".to_string());
                if !advance(&mut current, &mut fallbacks, &mut work, &mut attempt_index) {
                    finalize_failed(&inner, &mut work, &failure_kinds, deferred_id.as_deref());
                    return;
                }
                continue;
            }
            QuotaDecision::Allowed => {}
        }

        let Some(adapter) = services.registry.get(&provider) else {
            warn!(provider = %provider, "no adapter registered");
            work.record_event(format!("{provider}:failed:no-adapter"));
            failure_kinds.push("no-adapter".to_string());
            if !advance(&mut current, &mut fallbacks, &mut work, &mut attempt_index) {
                finalize_failed(&inner, &mut work, &failure_kinds, deferred_id.as_deref());
                return;
            }
            continue;
        };

        // Provider admission. The pool slot stays held while waiting.
        let slot = inner.provider_slot(&provider);
        let Ok(_slot_permit) = slot.acquire_owned().await else {
            return;
        };

        let options = DownloadOptions::from_config(&services.config, &provider);
        let download = adapter.download(&services.executor, &current.candidate, &ctx, &mut namer, &options);
        let result = match services.config.download.worker_timeout() {
            Some(deadline) => match tokio::time::timeout(deadline, download).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout {
                    seconds: deadline.as_secs(),
                }),
            },
            None => download.await,
        };
        drop(_slot_permit);

        match result {
            Ok(outcome)
                if outcome.any_written()
                    || outcome.skipped_reason.as_deref() == Some("already-exists") =>
            {
                if outcome.any_written() {
                    services.quota.record(&provider);
                }
                info!(
                    provider = %provider,
                    files = outcome.files_written.len(),
                    bytes = outcome.bytes_written,
                    "download chain complete"
                );
                work.selected = Some((&current).into());
                work.transition(WorkStatus::Completed, format!("{provider}:completed"));
                finalize_terminal(&inner, &work, deferred_id.as_deref());
                return;
            }
            Ok(outcome) => {
                let reason = outcome
                    .skipped_reason
                    .unwrap_or_else(|| "no-artifacts".to_string());
                warn!(provider = %provider, reason, "download produced nothing");
                work.record_event(format!("{provider}:failed:{reason}"));
                failure_kinds.push(reason);
            }
            Err(FetchError::Timeout { seconds }) => {
                warn!(provider = %provider, seconds, "worker deadline hit; cancelling");
                cleanup_partials(&ctx.objects_dir()).await;
                work.record_event(format!("{provider}:failed:timeout"));
                failure_kinds.push("timeout".to_string());
            }
            Err(error) => {
                let kind = error.kind();
                warn!(provider = %provider, %error, kind, "candidate download failed");
                cleanup_partials(&ctx.objects_dir()).await;
                work.record_event(format!("{provider}:failed:{kind}"));
                failure_kinds.push(kind.to_string());

                if matches!(error, FetchError::BudgetExceeded(_))
                    && services.shutdown.is_budget_stop()
                {
                    work.transition(WorkStatus::Failed, "failed:budget-exceeded");
                    finalize_terminal(&inner, &work, deferred_id.as_deref());
                    return;
                }
            }
        }

        if !advance(&mut current, &mut fallbacks, &mut work, &mut attempt_index) {
            finalize_failed(&inner, &mut work, &failure_kinds, deferred_id.as_deref());
            return;
        }
    }
}

/// Moves the chain to the next fallback candidate. False when spent.
fn advance(
    current: &mut ScoredCandidate,
    fallbacks: &mut VecDeque<ScoredCandidate>,
    work: &mut Work,
    attempt_index: &mut u32,
) -> bool {
    match fallbacks.pop_front() {
        Some(next) => {
            *attempt_index += 1;
            info!(
                provider = %next.candidate.provider_key,
                source_id = %next.candidate.source_id,
                attempt = *attempt_index,
                "falling back to next candidate"
            );
            work.record_event(format!("fallback:{}", next.candidate.provider_key));
            *current = next;
            true
        }
        None => false,
    }
}

fn finalize_failed(inner: &Inner, work: &mut Work, failure_kinds: &[String], deferred_id: Option<&str>) {
    let reason = if !failure_kinds.is_empty()
        && failure_kinds.iter().all(|kind| kind == "circuit-open")
    {
        "all-providers-unavailable"
    } else {
        "all-candidates-failed"
    };
    work.transition(WorkStatus::Failed, format!("failed:{reason}"));
    finalize_terminal(inner, work, deferred_id);
}

/// Persists a terminal status everywhere it is reflected: `work.json`,
/// `index.csv`, the input CSV, deferred bookkeeping, and counters.
fn finalize_terminal(inner: &Inner, work: &Work, deferred_id: Option<&str>) {
    let services = &inner.services;
    let success = work.status == WorkStatus::Completed;

    if let Err(error) = services.journal.write_work(work) {
        error!(%error, "failed to persist terminal work.json");
    }
    if let Err(error) = services.journal.append_index(&IndexRow::for_work(work)) {
        error!(%error, "failed to append index row");
    }
    if let Some(input_csv) = &services.input_csv {
        let link = work.selected.as_ref().and_then(|s| s.item_url.as_deref());
        if let Err(error) = input_csv.mark_result(&work.input.entry_id, success, link) {
            warn!(%error, "failed to update input CSV");
        }
    }
    if let Some(id) = deferred_id {
        if success {
            services.deferred.mark_completed(id);
        } else {
            services
                .deferred
                .mark_failed(id, work.status.as_str().to_string());
        }
    }
    if success {
        inner.stats.completed.fetch_add(1, Ordering::SeqCst);
    } else {
        inner.stats.failed.fetch_add(1, Ordering::SeqCst);
    }
    if let Err(error) = services.state.flush(&services.quota, &services.deferred) {
        warn!(%error, "failed to persist state file");
    }
}

/// Deletes leftover `.part` files after a cancellation or failure.
async fn cleanup_partials(objects_dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(objects_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_partial = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == PARTIAL_SUFFIX);
        if is_partial {
            if let Err(error) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), %error, "failed to remove partial file");
            } else {
                debug!(path = %path.display(), "removed partial file");
            }
        }
    }
}
