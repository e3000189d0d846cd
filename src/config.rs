//! Configuration loading and validation.
//!
//! The whole run is driven by a single JSON document. Every section has
//! serde defaults so a missing file yields a usable configuration; an
//! unreadable or internally inconsistent file is a hard error surfaced
//! before any work starts.
//!
//! The path is resolved from, in order: an explicit CLI flag, the
//! `CHRONO_CONFIG_PATH` environment variable, and `config.json` in the
//! working directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable overriding the config file path.
pub const CONFIG_PATH_ENV: &str = "CHRONO_CONFIG_PATH";

/// Default config file name in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How TLS certificate verification failures are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SslErrorPolicy {
    /// Verification failures are terminal.
    #[default]
    Fail,
    /// Retry exactly once with verification disabled.
    RetryInsecureOnce,
}

/// Per-provider network policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub delay_ms: u64,
    pub jitter_ms: u64,
    pub max_attempts: u32,
    pub base_backoff_s: f64,
    pub backoff_multiplier: f64,
    pub max_backoff_s: f64,
    pub timeout_s: u64,
    pub circuit_breaker_enabled: bool,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_s: u64,
    pub ssl_error_policy: SslErrorPolicy,
    pub headers: BTreeMap<String, String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            jitter_ms: 0,
            max_attempts: 5,
            base_backoff_s: 1.5,
            backoff_multiplier: 1.5,
            max_backoff_s: 60.0,
            timeout_s: 30,
            circuit_breaker_enabled: true,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_s: 60,
            ssl_error_policy: SslErrorPolicy::Fail,
            headers: BTreeMap::new(),
        }
    }
}

impl NetworkConfig {
    /// Request timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }

    /// Minimum spacing between requests to the same provider.
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Upper bound of the random jitter added to the spacing.
    #[must_use]
    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }
}

/// Per-provider daily quota policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub enabled: bool,
    /// Downloads per reset window; 0 means unlimited.
    pub daily_limit: u32,
    pub reset_hours: u64,
    /// Defer to the queue on exhaustion instead of falling back.
    pub wait_for_reset: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            daily_limit: 0,
            reset_hours: 24,
            wait_for_reset: true,
        }
    }
}

/// Settings block for a single provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub network: NetworkConfig,
    pub quota: QuotaConfig,
    /// Search result cap; falls back to `selection.max_candidates_per_provider`.
    pub max_results: Option<usize>,
    /// Title score threshold override for this provider.
    pub min_title_score: Option<f64>,
    /// Page image cap for IIIF downloads; 0 or absent means all pages.
    pub max_pages: Option<usize>,
}

/// Resume behavior applied before searching each input record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// Skip records whose `work.json` says `completed`.
    #[default]
    SkipCompleted,
    /// Skip records whose `objects/` directory contains at least one file.
    SkipIfHasObjects,
    /// Skip records whose `retrievable` CSV column is True.
    ResumeFromCsv,
    /// Never skip.
    ReprocessAll,
}

/// Download section of the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub resume_mode: ResumeMode,
    pub prefer_pdf_over_images: bool,
    pub download_manifest_renderings: bool,
    pub max_renderings_per_manifest: usize,
    pub rendering_mime_whitelist: Vec<String>,
    pub overwrite_existing: bool,
    pub include_metadata: bool,
    /// Object file extensions accepted from adapters; empty means any.
    pub allowed_object_extensions: Vec<String>,
    pub max_parallel_downloads: usize,
    /// Per-provider concurrency caps; the `default` key applies otherwise.
    pub provider_concurrency: BTreeMap<String, usize>,
    /// Per-task deadline in seconds; 0 disables the deadline.
    pub worker_timeout_s: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        let mut provider_concurrency = BTreeMap::new();
        provider_concurrency.insert("default".to_string(), 2);
        Self {
            resume_mode: ResumeMode::default(),
            prefer_pdf_over_images: true,
            download_manifest_renderings: true,
            max_renderings_per_manifest: 1,
            rendering_mime_whitelist: vec![
                "application/pdf".to_string(),
                "application/epub+zip".to_string(),
            ],
            overwrite_existing: false,
            include_metadata: true,
            allowed_object_extensions: Vec::new(),
            max_parallel_downloads: 1,
            provider_concurrency,
            worker_timeout_s: 0,
        }
    }
}

impl DownloadConfig {
    /// Concurrency cap for a provider, falling back to the `default` entry.
    #[must_use]
    pub fn provider_concurrency(&self, provider_key: &str) -> usize {
        self.provider_concurrency
            .get(provider_key)
            .or_else(|| self.provider_concurrency.get("default"))
            .copied()
            .unwrap_or(2)
            .max(1)
    }

    /// Per-task deadline, if configured.
    #[must_use]
    pub fn worker_timeout(&self) -> Option<Duration> {
        (self.worker_timeout_s > 0).then(|| Duration::from_secs(self.worker_timeout_s))
    }
}

/// What happens when a budget limit would be exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExceedPolicy {
    /// Fail the current artifact only.
    #[default]
    Skip,
    /// Fail the artifact and drain the scheduler.
    Stop,
}

/// Run-wide byte limits per content class, in GB. 0 means unlimited.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TotalLimits {
    pub pdfs_gb: f64,
    pub images_gb: f64,
    pub metadata_gb: f64,
}

/// Per-work byte limits. Metadata is small, so its unit is MB. 0 means
/// unlimited.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerWorkLimits {
    pub pdfs_gb: f64,
    pub images_gb: f64,
    pub metadata_mb: f64,
}

/// `download_limits` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadLimits {
    pub total: TotalLimits,
    pub per_work: PerWorkLimits,
    pub on_exceed: ExceedPolicy,
}

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Converts a GB config value into an optional byte limit.
#[must_use]
pub fn gb_to_bytes(gb: f64) -> Option<u64> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    (gb > 0.0).then(|| (gb * BYTES_PER_GB) as u64)
}

/// Converts an MB config value into an optional byte limit.
#[must_use]
pub fn mb_to_bytes(mb: f64) -> Option<u64> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    (mb > 0.0).then(|| (mb * BYTES_PER_MB) as u64)
}

/// Candidate selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Search every enabled provider, then rank globally.
    #[default]
    CollectAndSelect,
    /// Walk the hierarchy and stop at the first acceptable hit.
    SequentialFirstHit,
}

/// `selection` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub strategy: SelectionStrategy,
    pub provider_hierarchy: Vec<String>,
    pub min_title_score: f64,
    pub creator_weight: f64,
    pub max_candidates_per_provider: usize,
    /// Concurrent provider searches within one work.
    pub max_parallel_searches: usize,
    pub keep_non_selected_metadata: bool,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            provider_hierarchy: Vec::new(),
            min_title_score: 85.0,
            creator_weight: 0.2,
            max_candidates_per_provider: 5,
            max_parallel_searches: 1,
            keep_non_selected_metadata: true,
        }
    }
}

/// `naming` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    pub include_creator_in_work_dir: bool,
    pub include_year_in_work_dir: bool,
    pub title_slug_max_len: usize,
    pub creator_slug_max_len: usize,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            include_creator_in_work_dir: true,
            include_year_in_work_dir: true,
            title_slug_max_len: 80,
            creator_slug_max_len: 40,
        }
    }
}

/// `deferred` section: state file location and replay cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeferredConfig {
    pub state_file: PathBuf,
    pub check_interval_s: u64,
    pub max_retries: u32,
}

impl Default for DeferredConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from(".downloader_state.json"),
            check_interval_s: 30,
            max_retries: 5,
        }
    }
}

/// `general` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub user_agent: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("chronofetch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// The full configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    /// Enabled flags per provider key.
    pub providers: BTreeMap<String, bool>,
    pub provider_settings: BTreeMap<String, ProviderSettings>,
    pub download: DownloadConfig,
    pub download_limits: DownloadLimits,
    pub selection: SelectionConfig,
    pub naming: NamingConfig,
    pub deferred: DeferredConfig,
}

impl Config {
    /// Loads configuration from the resolved path and validates it.
    ///
    /// A missing file yields defaults when the path came from the fallback
    /// chain; an explicitly given path that does not exist is an error.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match explicit_path {
            Some(p) => (p.to_path_buf(), true),
            None => match std::env::var_os(CONFIG_PATH_ENV) {
                Some(p) => (PathBuf::from(p), true),
                None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
            },
        };

        let config = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            let parsed: Self =
                serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?;
            info!(path = %path.display(), "loaded configuration");
            parsed
        } else if required {
            return Err(ConfigError::Read {
                path,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
            });
        } else {
            debug!("no config file found; using defaults");
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.download.max_parallel_downloads == 0 {
            return Err(ConfigError::Invalid(
                "download.max_parallel_downloads must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.selection.creator_weight) {
            return Err(ConfigError::Invalid(format!(
                "selection.creator_weight must be within 0..=1, got {}",
                self.selection.creator_weight
            )));
        }

        // A per-work cap larger than the run-wide cap can never bind.
        let pairs = [
            (
                "pdfs",
                gb_to_bytes(self.download_limits.per_work.pdfs_gb),
                gb_to_bytes(self.download_limits.total.pdfs_gb),
            ),
            (
                "images",
                gb_to_bytes(self.download_limits.per_work.images_gb),
                gb_to_bytes(self.download_limits.total.images_gb),
            ),
            (
                "metadata",
                mb_to_bytes(self.download_limits.per_work.metadata_mb),
                gb_to_bytes(self.download_limits.total.metadata_gb),
            ),
        ];
        for (class, per_work, total) in pairs {
            if let (Some(pw), Some(tot)) = (per_work, total) {
                if pw > tot {
                    return Err(ConfigError::Invalid(format!(
                        "download_limits.per_work {class} limit ({pw} bytes) exceeds the total limit ({tot} bytes)"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Network policy for a provider, defaults where unset.
    #[must_use]
    pub fn network(&self, provider_key: &str) -> NetworkConfig {
        self.provider_settings
            .get(provider_key)
            .map(|s| s.network.clone())
            .unwrap_or_default()
    }

    /// Quota policy for a provider, defaults where unset.
    #[must_use]
    pub fn quota(&self, provider_key: &str) -> QuotaConfig {
        self.provider_settings
            .get(provider_key)
            .map(|s| s.quota.clone())
            .unwrap_or_default()
    }

    /// Title score threshold for a provider, honoring its override.
    #[must_use]
    pub fn min_title_score(&self, provider_key: &str) -> f64 {
        self.provider_settings
            .get(provider_key)
            .and_then(|s| s.min_title_score)
            .unwrap_or(self.selection.min_title_score)
    }

    /// Search result cap for a provider, honoring its override.
    #[must_use]
    pub fn max_results(&self, provider_key: &str) -> usize {
        self.provider_settings
            .get(provider_key)
            .and_then(|s| s.max_results)
            .unwrap_or(self.selection.max_candidates_per_provider)
    }

    /// Page image cap for a provider; `None` means download all pages.
    #[must_use]
    pub fn max_pages(&self, provider_key: &str) -> Option<usize> {
        self.provider_settings
            .get(provider_key)
            .and_then(|s| s.max_pages)
            .filter(|n| *n > 0)
    }

    /// Keys of providers whose enabled flag is set.
    #[must_use]
    pub fn enabled_provider_keys(&self) -> Vec<String> {
        self.providers
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(key, _)| key.clone())
            .collect()
    }
}
