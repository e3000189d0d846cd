//! CLI entry point: composition root and process lifecycle.
//!
//! Builds the process-scope services exactly once (budget accountant,
//! HTTP executor, quota ledger, deferred queue, journal), wires them into
//! the scheduler and pipeline, and maps outcomes to exit codes.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use chronofetch::budget::{BudgetAccountant, BudgetLimits};
use chronofetch::config::Config;
use chronofetch::deferred::DeferredQueue;
use chronofetch::input::InputCsv;
use chronofetch::journal::WorkJournal;
use chronofetch::net::HttpExecutor;
use chronofetch::pipeline::{Pipeline, RunSummary};
use chronofetch::provider::build_default_registry;
use chronofetch::quota::QuotaLedger;
use chronofetch::scheduler::{DownloadScheduler, SchedulerServices};
use chronofetch::selector::Selector;
use chronofetch::shutdown::{ShutdownHandle, ShutdownReason};
use chronofetch::state::StateStore;

mod cli;

use cli::Cli;

/// Process exit classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessExit {
    Success,
    ConfigError,
    InputError,
    BudgetStop,
    Interrupted,
}

impl ProcessExit {
    const fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::ConfigError => 2,
            Self::InputError => 3,
            Self::BudgetStop => 4,
            Self::Interrupted => 130,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    ExitCode::from(run(cli).await.code())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> ProcessExit {
    if cli.force_interactive {
        warn!("interactive UI is not available in this build; continuing in CLI mode");
    }
    if cli.force_cli {
        debug!("plain CLI mode forced");
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "configuration error");
            return ProcessExit::ConfigError;
        }
    };

    // Process-scope services, constructed once and injected everywhere.
    let shutdown = ShutdownHandle::new();
    let budget = Arc::new(BudgetAccountant::new(
        BudgetLimits::from_config(&config.download_limits),
        config.download_limits.on_exceed,
        shutdown.clone(),
    ));
    let executor = match HttpExecutor::new(config.clone(), Arc::clone(&budget)) {
        Ok(executor) => Arc::new(executor),
        Err(error) => {
            error!(%error, "failed to initialize HTTP layer");
            return ProcessExit::ConfigError;
        }
    };
    let registry = Arc::new(build_default_registry());
    let quota = Arc::new(QuotaLedger::new(config.clone()));
    let deferred = Arc::new(DeferredQueue::new(config.deferred.max_retries));
    let state = Arc::new(StateStore::new(config.deferred.state_file.clone()));
    state.hydrate(&quota, &deferred);

    if cli.quota_status {
        print_quota_status(&quota, &deferred);
        return ProcessExit::Success;
    }
    if cli.cleanup_deferred {
        let removed = deferred.compact(chrono::Utc::now());
        if let Err(error) = state.flush(&quota, &deferred) {
            error!(%error, "failed to persist state");
        }
        println!("Removed {removed} stale deferred item(s).");
        return ProcessExit::Success;
    }

    let Some(input_path) = cli.input.as_deref() else {
        error!("an input CSV is required unless --quota-status or --cleanup-deferred is given");
        return ProcessExit::InputError;
    };
    let input_csv = match InputCsv::load(input_path) {
        Ok(input) => Arc::new(input),
        Err(error) => {
            error!(%error, "input error");
            return ProcessExit::InputError;
        }
    };

    let journal = Arc::new(WorkJournal::new(&cli.output_dir, config.naming.clone()));

    let scheduler = Arc::new(DownloadScheduler::new(SchedulerServices {
        config: config.clone(),
        executor: Arc::clone(&executor),
        registry: Arc::clone(&registry),
        quota: Arc::clone(&quota),
        deferred: Arc::clone(&deferred),
        state: Arc::clone(&state),
        journal: Arc::clone(&journal),
        input_csv: Some(Arc::clone(&input_csv)),
        shutdown: shutdown.clone(),
    }));
    let ticker = scheduler.spawn_deferred_ticker();

    // Ctrl-C triggers the graceful drain path.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; draining");
                shutdown.request(ShutdownReason::Interrupt);
            }
        });
    }

    let selector = Selector::new(
        config.clone(),
        Arc::clone(&registry),
        Arc::clone(&executor),
    );
    let pipeline = Pipeline::new(
        config,
        selector,
        Arc::clone(&scheduler),
        Arc::clone(&journal),
        Arc::clone(&input_csv),
        Arc::clone(&budget),
        shutdown.clone(),
        cli.dry_run,
    );

    let summary = pipeline.run().await;
    ticker.abort();
    scheduler.flush_state();
    budget.log_summary();
    print_summary(&summary);

    if shutdown.is_budget_stop() {
        ProcessExit::BudgetStop
    } else if shutdown.is_requested() {
        ProcessExit::Interrupted
    } else {
        ProcessExit::Success
    }
}

fn print_summary(summary: &RunSummary) {
    println!("Run summary:");
    println!("  processed: {}", summary.processed);
    println!("  completed: {}", summary.completed);
    println!("  failed:    {}", summary.failed);
    println!("  no match:  {}", summary.no_match);
    println!("  deferred:  {}", summary.deferred);
    println!("  skipped:   {}", summary.skipped);
}

fn print_quota_status(quota: &QuotaLedger, deferred: &DeferredQueue) {
    let snapshot = quota.snapshot();
    if snapshot.is_empty() {
        println!("No quota-tracked providers yet.");
    } else {
        println!("Quota ledger:");
        for (provider, state) in snapshot {
            println!(
                "  {provider}: {}/{} used (window started {}, resets every {}h)",
                state.used_today, state.daily_limit, state.window_start_wall, state.reset_hours
            );
        }
    }

    let items = deferred.snapshot();
    if items.is_empty() {
        println!("Deferred queue is empty.");
    } else {
        println!("Deferred queue ({} item(s)):", items.len());
        for item in items {
            println!(
                "  [{:?}] '{}' via {} ready at {} (attempt {})",
                item.status,
                item.title,
                item.candidate.candidate.provider_key,
                item.ready_at,
                item.attempt_index
            );
        }
    }
}
