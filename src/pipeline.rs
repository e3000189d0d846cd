//! Pipeline driver: the per-record lifecycle.
//!
//! For each input record: apply the resume policy, search and select,
//! journal the pending work, then either finish it directly (dry runs and
//! no-matches) or hand it to the scheduler. The driver owns a work until
//! the moment it is enqueued; ownership returns to journal finalization
//! inside the scheduler once the chain terminates.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::budget::{BudgetAccountant, ContentClass};
use crate::config::Config;
use crate::input::InputCsv;
use crate::journal::{IndexRow, WorkJournal};
use crate::model::{InputRecord, Work, WorkStatus};
use crate::naming::ArtifactNamer;
use crate::scheduler::DownloadScheduler;
use crate::selector::Selector;
use crate::shutdown::ShutdownHandle;

/// Counters reported at the end of a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub no_match: usize,
    pub deferred: usize,
    pub skipped: usize,
}

/// The per-run driver.
pub struct Pipeline {
    config: Config,
    selector: Selector,
    scheduler: Arc<DownloadScheduler>,
    journal: Arc<WorkJournal>,
    input_csv: Arc<InputCsv>,
    budget: Arc<BudgetAccountant>,
    shutdown: ShutdownHandle,
    dry_run: bool,
}

impl Pipeline {
    /// Wires the driver over the shared services.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: Config,
        selector: Selector,
        scheduler: Arc<DownloadScheduler>,
        journal: Arc<WorkJournal>,
        input_csv: Arc<InputCsv>,
        budget: Arc<BudgetAccountant>,
        shutdown: ShutdownHandle,
        dry_run: bool,
    ) -> Self {
        Self {
            config,
            selector,
            scheduler,
            journal,
            input_csv,
            budget,
            shutdown,
            dry_run,
        }
    }

    /// Processes every input record, then waits for the scheduler to
    /// drain.
    pub async fn run(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        let records: Vec<InputRecord> = self.input_csv.records().to_vec();

        for record in &records {
            if self.shutdown.is_requested() {
                info!("shutdown requested; not starting further works");
                break;
            }
            summary.processed += 1;
            self.process_record(record, &mut summary).await;
        }

        self.scheduler.wait_idle().await;
        self.scheduler.flush_state();

        summary.completed += self.scheduler.stats().completed();
        summary.failed += self.scheduler.stats().failed();
        summary.deferred += self.scheduler.stats().deferred();
        info!(
            processed = summary.processed,
            completed = summary.completed,
            failed = summary.failed,
            no_match = summary.no_match,
            deferred = summary.deferred,
            skipped = summary.skipped,
            "run finished"
        );
        summary
    }

    #[instrument(skip(self, summary), fields(entry_id = %record.entry_id, title = %record.title))]
    async fn process_record(&self, record: &InputRecord, summary: &mut RunSummary) {
        if let Some(reason) = self
            .journal
            .should_skip(record, self.config.download.resume_mode)
        {
            debug!(reason, "skipping per resume policy");
            summary.skipped += 1;
            return;
        }

        let work_dir = self.journal.work_dir_for(record);
        let mut work = Work::new(record.clone(), work_dir);
        self.budget.begin_work(&work.work_id);

        let output = self.selector.select(record).await;
        work.candidates = output.candidates;
        work.rejected = output.rejected;
        work.record_event(format!("searched:{}-candidates", work.candidates.len()));

        let Some(selection) = output.selection else {
            work.transition(WorkStatus::NoMatch, "no-match");
            summary.no_match += 1;
            self.finalize_locally(&work);
            return;
        };

        work.selected = Some((&selection.primary).into());

        if self.config.selection.keep_non_selected_metadata {
            self.persist_candidate_metadata(&work);
        }

        // The pending document goes to disk before enqueue so a crash
        // leaves a resumable trace.
        if let Err(error) = self.journal.write_work(&work) {
            warn!(%error, "failed to journal pending work");
        }

        if self.dry_run {
            info!("dry run: selection journaled, download skipped");
            work.transition(WorkStatus::Completed, "dry-run");
            summary.completed += 1;
            self.finalize_locally(&work);
            return;
        }

        self.scheduler.submit(work, selection);

        // A single-worker pool runs strictly sequentially: the next
        // record is not considered until this chain terminates.
        if self.config.download.max_parallel_downloads == 1 {
            self.scheduler.wait_idle().await;
        }
    }

    /// Terminal bookkeeping for works that never reach the scheduler.
    fn finalize_locally(&self, work: &Work) {
        if let Err(error) = self.journal.write_work(work) {
            warn!(%error, "failed to persist work.json");
        }
        if let Err(error) = self.journal.append_index(&IndexRow::for_work(work)) {
            warn!(%error, "failed to append index row");
        }
    }

    /// Writes every candidate's payload under `metadata/` for auditing,
    /// counted against the metadata budget.
    fn persist_candidate_metadata(&self, work: &Work) {
        let dir = work.work_dir.join("metadata");
        if let Err(error) = std::fs::create_dir_all(&dir) {
            warn!(%error, "cannot create metadata directory");
            return;
        }
        let mut namer = ArtifactNamer::new(self.journal.stem_for(&work.input));
        for candidate in &work.candidates {
            let body = match serde_json::to_vec_pretty(candidate) {
                Ok(body) => body,
                Err(error) => {
                    warn!(%error, "candidate not serializable");
                    continue;
                }
            };
            if self
                .budget
                .reserve(
                    ContentClass::Metadata,
                    Some(&work.work_id),
                    body.len() as u64,
                )
                .is_err()
            {
                debug!("metadata budget spent; keeping remaining candidates in work.json only");
                break;
            }
            let path = dir.join(namer.next_metadata(&candidate.candidate.provider_key));
            match std::fs::write(&path, &body) {
                Ok(()) => {
                    self.budget.account(
                        ContentClass::Metadata,
                        Some(&work.work_id),
                        body.len() as u64,
                    );
                    self.budget
                        .commit_file(ContentClass::Metadata, Some(&work.work_id));
                }
                Err(error) => warn!(path = %path.display(), %error, "failed to save candidate metadata"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_default_is_zero() {
        let summary = RunSummary::default();
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.completed + summary.failed + summary.skipped, 0);
    }
}
