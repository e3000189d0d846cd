//! End-to-end pipeline scenarios with scripted provider adapters.
//!
//! No network: adapters are in-test fakes that return fixed candidates
//! and write files straight into the work directory, so these tests
//! exercise selection, scheduling, fallback, budgets, the journal, and
//! the input-CSV sync together.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chronofetch::budget::{BudgetAccountant, BudgetLimits, ContentClass};
use chronofetch::config::{Config, ExceedPolicy, ProviderSettings, QuotaConfig};
use chronofetch::context::TaskContext;
use chronofetch::input::InputCsv;
use chronofetch::journal::WorkJournal;
use chronofetch::model::{Candidate, DownloadOutcome, WorkStatus};
use chronofetch::naming::ArtifactNamer;
use chronofetch::net::{FetchError, HttpExecutor};
use chronofetch::pipeline::Pipeline;
use chronofetch::provider::{DownloadOptions, ProviderAdapter, ProviderInfo, ProviderRegistry};
use chronofetch::quota::QuotaLedger;
use chronofetch::scheduler::{DownloadScheduler, SchedulerServices};
use chronofetch::selector::Selector;
use chronofetch::shutdown::ShutdownHandle;
use chronofetch::state::StateStore;
use chronofetch::DeferredQueue;

/// What a scripted adapter should do on download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DownloadScript {
    /// Write one small PDF.
    WritePdf,
    /// Fail every attempt with a retry-exhausted transient error.
    FailTransient,
    /// Consume this many budget bytes, then write the PDF.
    ConsumeBudget(u64),
}

struct ScriptedProvider {
    info: ProviderInfo,
    /// Candidates returned verbatim from search.
    results: Vec<Candidate>,
    script: DownloadScript,
    download_calls: AtomicU32,
}

impl ScriptedProvider {
    fn new(key: &'static str, results: Vec<Candidate>, script: DownloadScript) -> Self {
        Self {
            info: ProviderInfo {
                key,
                display_name: key,
            },
            results,
            script,
            download_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn info(&self) -> ProviderInfo {
        self.info
    }

    async fn search(
        &self,
        _executor: &HttpExecutor,
        _title: &str,
        _creator: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<Candidate>, FetchError> {
        Ok(self.results.iter().take(max_results).cloned().collect())
    }

    async fn download(
        &self,
        executor: &HttpExecutor,
        candidate: &Candidate,
        ctx: &TaskContext,
        namer: &mut ArtifactNamer,
        _options: &DownloadOptions,
    ) -> Result<DownloadOutcome, FetchError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            DownloadScript::FailTransient => Err(FetchError::Exhausted {
                url: format!("https://test/{}", candidate.source_id),
                attempts: 3,
                last: Box::new(FetchError::Transient {
                    url: format!("https://test/{}", candidate.source_id),
                    detail: "HTTP 503".to_string(),
                }),
            }),
            DownloadScript::ConsumeBudget(bytes) => {
                executor
                    .budget()
                    .consume(ContentClass::Pdf, Some(&ctx.work_id), bytes)?;
                write_pdf(candidate, ctx, namer).await
            }
            DownloadScript::WritePdf => write_pdf(candidate, ctx, namer).await,
        }
    }
}

async fn write_pdf(
    candidate: &Candidate,
    ctx: &TaskContext,
    namer: &mut ArtifactNamer,
) -> Result<DownloadOutcome, FetchError> {
    let dir = ctx.objects_dir();
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| FetchError::io(&dir, e))?;
    let path = dir.join(namer.next_object(&ctx.provider_key, "pdf"));
    tokio::fs::write(&path, candidate.source_id.as_bytes())
        .await
        .map_err(|e| FetchError::io(&path, e))?;
    Ok(DownloadOutcome {
        files_written: vec![path],
        bytes_written: candidate.source_id.len() as u64,
        skipped_reason: None,
    })
}

fn candidate(provider: &str, title: &str, source_id: &str) -> Candidate {
    let mut c = Candidate::new(provider, provider, title, source_id);
    c.item_url = Some(format!("https://example/{provider}/{source_id}"));
    c
}

struct Fixture {
    dir: tempfile::TempDir,
    config: Config,
    providers: Vec<Arc<ScriptedProvider>>,
    dry_run: bool,
}

struct RunArtifacts {
    summary: chronofetch::RunSummary,
    journal: Arc<WorkJournal>,
    input_csv: Arc<InputCsv>,
    deferred: Arc<DeferredQueue>,
    shutdown: ShutdownHandle,
    output_root: PathBuf,
    state_file: PathBuf,
    // Keeps the fixture's files alive for assertions.
    _dir: tempfile::TempDir,
}

impl Fixture {
    fn new(csv_body: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("works.csv"), csv_body).expect("write csv");
        let mut config = Config::default();
        config.deferred.state_file = dir.path().join(".downloader_state.json");
        Self {
            dir,
            config,
            providers: Vec::new(),
            dry_run: false,
        }
    }

    fn provider(
        &mut self,
        key: &'static str,
        results: Vec<Candidate>,
        script: DownloadScript,
    ) -> Arc<ScriptedProvider> {
        let provider = Arc::new(ScriptedProvider::new(key, results, script));
        self.providers.push(Arc::clone(&provider));
        self.config.providers.insert(key.to_string(), true);
        provider
    }

    async fn run(self) -> RunArtifacts {
        let output_root = self.dir.path().join("out");
        let state_file = self.config.deferred.state_file.clone();
        let shutdown = ShutdownHandle::new();
        let budget = Arc::new(BudgetAccountant::new(
            BudgetLimits::from_config(&self.config.download_limits),
            self.config.download_limits.on_exceed,
            shutdown.clone(),
        ));
        let executor =
            Arc::new(HttpExecutor::new(self.config.clone(), Arc::clone(&budget)).expect("executor"));

        let mut registry = ProviderRegistry::new();
        for provider in &self.providers {
            let adapter: Arc<dyn ProviderAdapter> = Arc::clone(provider) as Arc<dyn ProviderAdapter>;
            registry.register(adapter);
        }
        let registry = Arc::new(registry);

        let quota = Arc::new(QuotaLedger::new(self.config.clone()));
        let deferred = Arc::new(DeferredQueue::new(self.config.deferred.max_retries));
        let state = Arc::new(StateStore::new(self.config.deferred.state_file.clone()));
        state.hydrate(&quota, &deferred);

        let journal = Arc::new(WorkJournal::new(&output_root, self.config.naming.clone()));
        let input_csv = Arc::new(InputCsv::load(self.dir.path().join("works.csv")).expect("input"));

        let scheduler = Arc::new(DownloadScheduler::new(SchedulerServices {
            config: self.config.clone(),
            executor: Arc::clone(&executor),
            registry: Arc::clone(&registry),
            quota: Arc::clone(&quota),
            deferred: Arc::clone(&deferred),
            state,
            journal: Arc::clone(&journal),
            input_csv: Some(Arc::clone(&input_csv)),
            shutdown: shutdown.clone(),
        }));

        let selector = Selector::new(self.config.clone(), registry, executor);
        let pipeline = Pipeline::new(
            self.config,
            selector,
            Arc::clone(&scheduler),
            Arc::clone(&journal),
            Arc::clone(&input_csv),
            budget,
            shutdown.clone(),
            self.dry_run,
        );

        let summary = pipeline.run().await;
        RunArtifacts {
            summary,
            journal,
            input_csv,
            deferred,
            shutdown,
            output_root,
            state_file,
            _dir: self.dir,
        }
    }
}

fn read_index(output_root: &Path) -> Vec<csv::StringRecord> {
    let mut reader = csv::Reader::from_path(output_root.join("index.csv")).expect("index");
    reader.records().map(|r| r.expect("row")).collect()
}

#[tokio::test]
async fn match_on_first_provider_downloads_pdf() {
    let mut fixture = Fixture::new(
        "entry_id,short_title,main_author,retrievable,link\nE1,The Raven,Poe,,\n",
    );
    fixture.provider(
        "ia",
        vec![candidate("ia", "The Raven", "raven01")],
        DownloadScript::WritePdf,
    );
    fixture.config.selection.provider_hierarchy = vec!["ia".to_string()];

    let run = fixture.run().await;

    assert_eq!(run.summary.completed, 1);
    assert_eq!(run.summary.failed, 0);

    let rows = read_index(&run.output_root);
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][6], "ia"); // selected_provider_key
    assert_eq!(&rows[0][11], "completed");

    // One PDF landed in objects/.
    let work_dir = PathBuf::from(rows[0][2].to_string());
    let objects: Vec<_> = std::fs::read_dir(work_dir.join("objects"))
        .expect("objects dir")
        .map(|e| e.expect("entry").file_name().into_string().expect("name"))
        .collect();
    assert_eq!(objects, vec!["e1_the_raven_ia.pdf".to_string()]);

    // work.json agrees with the index row.
    let work = run.journal.read_work(&work_dir).expect("work.json");
    assert_eq!(work.status, WorkStatus::Completed);
    assert_eq!(work.selected.expect("selected").provider_key, "ia");

    // Input CSV was synced in place.
    let reloaded = InputCsv::load(run.input_csv.path()).expect("reload");
    let record = &reloaded.records()[0];
    assert_eq!(record.extra_columns.get("retrievable").expect("col"), "True");
    assert_eq!(
        record.extra_columns.get("link").expect("col"),
        "https://example/ia/raven01"
    );
}

#[tokio::test]
async fn unmatched_title_is_no_match_with_candidates_journaled() {
    let mut fixture =
        Fixture::new("entry_id,short_title,main_author\nE1,ZZZZ unknown,Nobody\n");
    fixture.provider(
        "ia",
        vec![candidate("ia", "A Completely Different Book", "other1")],
        DownloadScript::WritePdf,
    );

    let run = fixture.run().await;

    assert_eq!(run.summary.no_match, 1);
    assert_eq!(run.summary.completed, 0);

    let rows = read_index(&run.output_root);
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][11], "no_match");

    let work_dir = PathBuf::from(rows[0][2].to_string());
    let work = run.journal.read_work(&work_dir).expect("work.json");
    assert_eq!(work.status, WorkStatus::NoMatch);
    // Candidates persisted even without a selection.
    assert_eq!(work.candidates.len(), 1);
    assert!(!work.rejected.is_empty());
    // Nothing downloaded.
    assert!(!work_dir.join("objects").exists());
}

#[tokio::test]
async fn failing_primary_falls_back_to_second_provider() {
    let mut fixture = Fixture::new("entry_id,short_title\nE1,The Raven\n");
    fixture.provider(
        "ia",
        vec![candidate("ia", "The Raven", "raven01")],
        DownloadScript::FailTransient,
    );
    fixture.provider(
        "bnf",
        vec![candidate("bnf", "The Raven", "ark01")],
        DownloadScript::WritePdf,
    );
    // ia outranks bnf via hierarchy on equal scores.
    fixture.config.selection.provider_hierarchy = vec!["ia".to_string(), "bnf".to_string()];

    let run = fixture.run().await;

    assert_eq!(run.summary.completed, 1);
    let rows = read_index(&run.output_root);
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][6], "bnf");
    assert_eq!(&rows[0][11], "completed");

    let work_dir = PathBuf::from(rows[0][2].to_string());
    let work = run.journal.read_work(&work_dir).expect("work.json");
    let events: Vec<&str> = work.history.iter().map(|h| h.event.as_str()).collect();
    let failed = events
        .iter()
        .position(|e| *e == "ia:failed:transient")
        .expect("primary failure event");
    let completed = events
        .iter()
        .position(|e| *e == "bnf:completed")
        .expect("fallback completion event");
    assert!(failed < completed);
}

#[tokio::test]
async fn quota_exhaustion_defers_instead_of_downloading() {
    let mut fixture = Fixture::new("entry_id,short_title\nE1,The Raven\n");
    let annas = fixture.provider(
        "annas",
        vec![candidate("annas", "The Raven", "md5raven")],
        DownloadScript::WritePdf,
    );
    fixture.config.provider_settings.insert(
        "annas".to_string(),
        ProviderSettings {
            quota: QuotaConfig {
                enabled: true,
                daily_limit: 1,
                reset_hours: 24,
                wait_for_reset: true,
            },
            ..ProviderSettings::default()
        },
    );

    // First run spends the allowance; second run defers.
    let run = fixture.run().await;
    assert_eq!(run.summary.completed, 1);
    assert_eq!(annas.download_calls.load(Ordering::SeqCst), 1);

    let mut fixture2 = Fixture::new("entry_id,short_title\nE2,The Raven Again\n");
    let annas2 = fixture2.provider(
        "annas",
        vec![candidate("annas", "The Raven Again", "md5again")],
        DownloadScript::WritePdf,
    );
    fixture2.config.provider_settings.insert(
        "annas".to_string(),
        ProviderSettings {
            quota: QuotaConfig {
                enabled: true,
                daily_limit: 1,
                reset_hours: 24,
                wait_for_reset: true,
            },
            ..ProviderSettings::default()
        },
    );
    // Carry the first run's persisted quota state into the second run.
    std::fs::copy(&run.state_file, &fixture2.config.deferred.state_file)
        .expect("carry state file");

    let run2 = fixture2.run().await;
    assert_eq!(run2.summary.deferred, 1);
    assert_eq!(annas2.download_calls.load(Ordering::SeqCst), 0);
    assert_eq!(run2.deferred.live_count(), 1);
    let item = &run2.deferred.snapshot()[0];
    assert_eq!(item.candidate.candidate.provider_key, "annas");
    // ready_at lands one reset window after the (carried-over) window start.
    assert!(item.ready_at > chrono::Utc::now());
    // Deferred works have no index row until they resolve.
    assert!(!run2.output_root.join("index.csv").exists());
}

#[tokio::test]
async fn budget_stop_drains_and_skips_remaining_works() {
    let mut fixture = Fixture::new(
        "entry_id,short_title\nE1,The Raven\nE2,Moby Dick\n",
    );
    fixture.provider(
        "ia",
        vec![
            candidate("ia", "The Raven", "raven01"),
            candidate("ia", "Moby Dick", "moby01"),
        ],
        // 2 MB against a 1 MB cap.
        DownloadScript::ConsumeBudget(2 * 1024 * 1024),
    );
    fixture.config.download_limits.total.pdfs_gb = 0.001; // ~1 MB
    fixture.config.download_limits.on_exceed = ExceedPolicy::Stop;

    let run = fixture.run().await;

    assert!(run.shutdown.is_budget_stop());
    assert_eq!(run.summary.failed, 1);
    // The second record never started: the budget stop drained the run.
    assert_eq!(run.summary.processed, 1);
    assert_eq!(run.summary.completed, 0);

    let rows = read_index(&run.output_root);
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][11], "failed");
    let work_dir = PathBuf::from(rows[0][2].to_string());
    let work = run.journal.read_work(&work_dir).expect("work.json");
    assert!(work
        .history
        .iter()
        .any(|h| h.event.contains("budget-exceeded")));
}

#[tokio::test]
async fn dry_run_journals_selection_without_downloading() {
    let mut fixture = Fixture::new("entry_id,short_title\nE1,The Raven\n");
    let ia = fixture.provider(
        "ia",
        vec![candidate("ia", "The Raven", "raven01")],
        DownloadScript::WritePdf,
    );
    fixture.dry_run = true;

    let run = fixture.run().await;

    assert_eq!(run.summary.completed, 1);
    assert_eq!(ia.download_calls.load(Ordering::SeqCst), 0);

    let rows = read_index(&run.output_root);
    assert_eq!(&rows[0][11], "completed");
    let work_dir = PathBuf::from(rows[0][2].to_string());
    assert!(work_dir.join("work.json").exists());
    assert!(!work_dir.join("objects").exists());
}

#[tokio::test]
async fn resume_skips_completed_works() {
    let csv = "entry_id,short_title\nE1,The Raven\n";
    let mut fixture = Fixture::new(csv);
    fixture.provider(
        "ia",
        vec![candidate("ia", "The Raven", "raven01")],
        DownloadScript::WritePdf,
    );
    let first = fixture.run().await;
    assert_eq!(first.summary.completed, 1);

    // Second run over a copy of the first run's journal skips the
    // finished work.
    let mut fixture = Fixture::new(csv);
    let ia = fixture.provider(
        "ia",
        vec![candidate("ia", "The Raven", "raven01")],
        DownloadScript::WritePdf,
    );
    let new_out = fixture.dir.path().join("out");
    copy_tree(&first.output_root, &new_out);

    let run = fixture.run().await;
    assert_eq!(run.summary.skipped, 1);
    assert_eq!(run.summary.completed, 0);
    assert_eq!(ia.download_calls.load(Ordering::SeqCst), 0);
}

fn copy_tree(src: &Path, dst: &Path) {
    std::fs::create_dir_all(dst).expect("mkdir");
    for entry in std::fs::read_dir(src).expect("read_dir") {
        let entry = entry.expect("entry");
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), &target).expect("copy");
        }
    }
}
