//! Download budget tracking and enforcement.
//!
//! Tracks bytes and file counts per content class at two scopes: the whole
//! run (`total`) and each work (`per_work`, keyed by work id so parallel
//! downloads never share a counter). Downloads reserve before opening a
//! stream and consume chunk by chunk, so a limit violation is detected
//! mid-stream rather than after the fact.
//!
//! When the `on_exceed` policy is `stop`, the first violation also trips
//! the shutdown handle so the scheduler drains and the process exits with
//! the budget exit code.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::{gb_to_bytes, mb_to_bytes, DownloadLimits, ExceedPolicy};
use crate::shutdown::{ShutdownHandle, ShutdownReason};

/// Content classification used for budget accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentClass {
    /// Bundled documents: PDF, EPUB, DjVu.
    Pdf,
    /// Page and cover images.
    Image,
    /// JSON/XML manifests and search payloads.
    Metadata,
}

impl ContentClass {
    /// Stable lowercase name for logs and summaries.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Image => "image",
            Self::Metadata => "metadata",
        }
    }

    /// All classes, for summary iteration.
    pub const ALL: [Self; 3] = [Self::Pdf, Self::Image, Self::Metadata];
}

impl std::fmt::Display for ContentClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scope of a violated limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetScope {
    Total,
    PerWork,
}

impl BudgetScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::PerWork => "per_work",
        }
    }
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when an operation would push a counter past its limit.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{scope} {class} budget exceeded: {attempted} bytes over a {limit}-byte limit")]
pub struct BudgetExceeded {
    pub class: ContentClass,
    pub scope: BudgetScope,
    pub limit: u64,
    pub attempted: u64,
}

/// Byte limits per class and scope, normalized from configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetLimits {
    total_pdf: Option<u64>,
    total_image: Option<u64>,
    total_metadata: Option<u64>,
    per_work_pdf: Option<u64>,
    per_work_image: Option<u64>,
    per_work_metadata: Option<u64>,
}

impl BudgetLimits {
    /// Normalizes the GB/MB configuration units into bytes.
    #[must_use]
    pub fn from_config(limits: &DownloadLimits) -> Self {
        Self {
            total_pdf: gb_to_bytes(limits.total.pdfs_gb),
            total_image: gb_to_bytes(limits.total.images_gb),
            total_metadata: gb_to_bytes(limits.total.metadata_gb),
            per_work_pdf: gb_to_bytes(limits.per_work.pdfs_gb),
            per_work_image: gb_to_bytes(limits.per_work.images_gb),
            per_work_metadata: mb_to_bytes(limits.per_work.metadata_mb),
        }
    }

    fn limit(&self, scope: BudgetScope, class: ContentClass) -> Option<u64> {
        match (scope, class) {
            (BudgetScope::Total, ContentClass::Pdf) => self.total_pdf,
            (BudgetScope::Total, ContentClass::Image) => self.total_image,
            (BudgetScope::Total, ContentClass::Metadata) => self.total_metadata,
            (BudgetScope::PerWork, ContentClass::Pdf) => self.per_work_pdf,
            (BudgetScope::PerWork, ContentClass::Image) => self.per_work_image,
            (BudgetScope::PerWork, ContentClass::Metadata) => self.per_work_metadata,
        }
    }
}

/// Byte and file counters for one class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassCounters {
    pub files: u64,
    pub bytes: u64,
}

#[derive(Debug, Default, Clone)]
struct CounterSet {
    by_class: HashMap<ContentClass, ClassCounters>,
}

impl CounterSet {
    fn get(&self, class: ContentClass) -> ClassCounters {
        self.by_class.get(&class).copied().unwrap_or_default()
    }

    fn bytes_mut(&mut self, class: ContentClass) -> &mut u64 {
        &mut self.by_class.entry(class).or_default().bytes
    }

    fn files_mut(&mut self, class: ContentClass) -> &mut u64 {
        &mut self.by_class.entry(class).or_default().files
    }
}

#[derive(Debug, Default)]
struct Inner {
    total: CounterSet,
    per_work: HashMap<String, CounterSet>,
}

/// Process-wide budget accountant.
///
/// Internally synchronized; cheap to share behind an `Arc`. Work-scoped
/// operations take the work id so concurrent works stay independent.
#[derive(Debug)]
pub struct BudgetAccountant {
    limits: BudgetLimits,
    policy: ExceedPolicy,
    shutdown: ShutdownHandle,
    inner: Mutex<Inner>,
}

impl BudgetAccountant {
    /// Creates an accountant wired to the shutdown handle for `stop`
    /// policy trips.
    #[must_use]
    pub fn new(limits: BudgetLimits, policy: ExceedPolicy, shutdown: ShutdownHandle) -> Self {
        Self {
            limits,
            policy,
            shutdown,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Unlimited accountant, used by dry runs and tests.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(
            BudgetLimits::default(),
            ExceedPolicy::Skip,
            ShutdownHandle::new(),
        )
    }

    /// Resets the counters of one work.
    pub fn begin_work(&self, work_id: &str) {
        let mut inner = self.lock();
        inner.per_work.insert(work_id.to_string(), CounterSet::default());
    }

    /// Pre-flight check: can `estimated_bytes` more of `class` be admitted
    /// under every applicable limit? An unknown size passes as 0 and the
    /// streaming checks take over.
    pub fn reserve(
        &self,
        class: ContentClass,
        work_id: Option<&str>,
        estimated_bytes: u64,
    ) -> Result<(), BudgetExceeded> {
        let inner = self.lock();
        self.check(&inner, class, work_id, estimated_bytes)
            .map_err(|e| self.on_exceed(e))
    }

    /// Admits and records `n` streamed bytes of `class`.
    ///
    /// On violation nothing is recorded and the caller must abandon the
    /// in-flight file.
    pub fn consume(
        &self,
        class: ContentClass,
        work_id: Option<&str>,
        n: u64,
    ) -> Result<(), BudgetExceeded> {
        let mut inner = self.lock();
        if let Err(e) = self.check(&inner, class, work_id, n) {
            drop(inner);
            return Err(self.on_exceed(e));
        }
        *inner.total.bytes_mut(class) += n;
        if let Some(work_id) = work_id {
            *inner
                .per_work
                .entry(work_id.to_string())
                .or_default()
                .bytes_mut(class) += n;
        }
        Ok(())
    }

    /// Rolls back bytes consumed by a stream whose file was deleted.
    pub fn release(&self, class: ContentClass, work_id: Option<&str>, n: u64) {
        let mut inner = self.lock();
        let total = inner.total.bytes_mut(class);
        *total = total.saturating_sub(n);
        if let Some(set) = work_id.and_then(|id| inner.per_work.get_mut(id)) {
            let bytes = set.bytes_mut(class);
            *bytes = bytes.saturating_sub(n);
        }
    }

    /// Records one completed file of `class`.
    pub fn commit_file(&self, class: ContentClass, work_id: Option<&str>) {
        let mut inner = self.lock();
        *inner.total.files_mut(class) += 1;
        if let Some(work_id) = work_id {
            *inner
                .per_work
                .entry(work_id.to_string())
                .or_default()
                .files_mut(class) += 1;
        }
    }

    /// Commits actual bytes in one shot (non-streaming writes).
    pub fn account(&self, class: ContentClass, work_id: Option<&str>, actual_bytes: u64) {
        let mut inner = self.lock();
        *inner.total.bytes_mut(class) += actual_bytes;
        if let Some(work_id) = work_id {
            *inner
                .per_work
                .entry(work_id.to_string())
                .or_default()
                .bytes_mut(class) += actual_bytes;
        }
    }

    /// Run-wide counters for a class.
    #[must_use]
    pub fn total(&self, class: ContentClass) -> ClassCounters {
        self.lock().total.get(class)
    }

    /// One work's counters for a class.
    #[must_use]
    pub fn per_work(&self, work_id: &str, class: ContentClass) -> ClassCounters {
        self.lock()
            .per_work
            .get(work_id)
            .map(|set| set.get(class))
            .unwrap_or_default()
    }

    /// Logs a run summary of all counters.
    pub fn log_summary(&self) {
        let inner = self.lock();
        for class in ContentClass::ALL {
            let counters = inner.total.get(class);
            info!(
                class = class.as_str(),
                files = counters.files,
                bytes = counters.bytes,
                "budget totals"
            );
        }
    }

    fn check(
        &self,
        inner: &Inner,
        class: ContentClass,
        work_id: Option<&str>,
        add: u64,
    ) -> Result<(), BudgetExceeded> {
        if let Some(limit) = self.limits.limit(BudgetScope::Total, class) {
            let current = inner.total.get(class).bytes;
            if current + add > limit {
                return Err(BudgetExceeded {
                    class,
                    scope: BudgetScope::Total,
                    limit,
                    attempted: current + add,
                });
            }
        }
        if let (Some(limit), Some(work_id)) =
            (self.limits.limit(BudgetScope::PerWork, class), work_id)
        {
            let current = inner
                .per_work
                .get(work_id)
                .map(|set| set.get(class).bytes)
                .unwrap_or(0);
            if current + add > limit {
                return Err(BudgetExceeded {
                    class,
                    scope: BudgetScope::PerWork,
                    limit,
                    attempted: current + add,
                });
            }
        }
        Ok(())
    }

    fn on_exceed(&self, err: BudgetExceeded) -> BudgetExceeded {
        warn!(
            class = err.class.as_str(),
            scope = err.scope.as_str(),
            limit = err.limit,
            "download budget exceeded"
        );
        if self.policy == ExceedPolicy::Stop {
            self.shutdown.request(ShutdownReason::BudgetStop);
        }
        err
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
