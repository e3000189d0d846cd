//! Unified persistent state file.
//!
//! The quota ledger and the deferred queue persist together in a single
//! JSON document (`.downloader_state.json` by default) so the two are
//! always consistent with each other on disk. Writes stage to a sibling
//! temp file and rename into place; readers tolerate a missing file on
//! first run.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::deferred::{DeferredItem, DeferredQueue};
use crate::quota::{QuotaLedger, QuotaState};

/// Current state document schema version.
pub const STATE_VERSION: u32 = 2;

/// Errors from state persistence.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse state file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// On-disk shape of the state document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub quota: BTreeMap<String, QuotaState>,
    #[serde(default)]
    pub deferred: Vec<DeferredItem>,
}

/// Reads and writes the unified state file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Creates a store for the given path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads persisted state. A missing file yields the empty default.
    pub fn load(&self) -> Result<PersistedState, StateError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no state file yet");
            return Ok(PersistedState {
                version: STATE_VERSION,
                ..PersistedState::default()
            });
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|source| StateError::Read {
            path: self.path.clone(),
            source,
        })?;
        let state: PersistedState =
            serde_json::from_str(&raw).map_err(|source| StateError::Parse {
                path: self.path.clone(),
                source,
            })?;
        debug!(
            path = %self.path.display(),
            version = state.version,
            quotas = state.quota.len(),
            deferred = state.deferred.len(),
            "loaded state file"
        );
        Ok(state)
    }

    /// Persists a snapshot atomically (temp file + rename).
    pub fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|source| StateError::Write {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|source| StateError::Write {
            path: self.path.clone(),
            source,
        })?;
        let body = serde_json::to_vec_pretty(state).map_err(|source| StateError::Write {
            path: self.path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, source),
        })?;
        tmp.write_all(&body).map_err(|source| StateError::Write {
            path: self.path.clone(),
            source,
        })?;
        tmp.persist(&self.path).map_err(|e| StateError::Write {
            path: self.path.clone(),
            source: e.error,
        })?;
        Ok(())
    }

    /// Convenience: snapshot the live services and persist them together.
    pub fn flush(&self, ledger: &QuotaLedger, queue: &DeferredQueue) -> Result<(), StateError> {
        let state = PersistedState {
            version: STATE_VERSION,
            quota: ledger.snapshot(),
            deferred: queue.snapshot(),
        };
        self.save(&state)
    }

    /// Convenience: load the file and hydrate the live services.
    ///
    /// Parse failures are logged and treated as a fresh start rather than
    /// aborting the run; a corrupt state file must not block downloads.
    pub fn hydrate(&self, ledger: &QuotaLedger, queue: &DeferredQueue) {
        match self.load() {
            Ok(state) => {
                ledger.restore(state.quota);
                queue.restore(state.deferred);
            }
            Err(error) => {
                warn!(%error, "ignoring unreadable state file");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{Config, ProviderSettings, QuotaConfig};
    use chrono::Utc;

    fn quota_config() -> Config {
        let mut config = Config::default();
        config.provider_settings.insert(
            "annas".to_string(),
            ProviderSettings {
                quota: QuotaConfig {
                    enabled: true,
                    daily_limit: 2,
                    reset_hours: 24,
                    wait_for_reset: true,
                },
                ..ProviderSettings::default()
            },
        );
        config
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join(".downloader_state.json"));
        let state = store.load().unwrap();
        assert_eq!(state.version, STATE_VERSION);
        assert!(state.quota.is_empty());
        assert!(state.deferred.is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join(".downloader_state.json"));

        let ledger = QuotaLedger::new(quota_config());
        ledger.record("annas");
        let queue = DeferredQueue::new(5);

        store.flush(&ledger, &queue).unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.version, STATE_VERSION);
        assert_eq!(state.quota.get("annas").unwrap().used_today, 1);
    }

    #[test]
    fn test_quota_persist_reload_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let ledger = QuotaLedger::new(quota_config());
        ledger.record("annas");
        ledger.record("annas");
        let before = ledger.snapshot();

        store.flush(&ledger, &DeferredQueue::new(5)).unwrap();

        let reloaded = QuotaLedger::new(quota_config());
        let fresh_queue = DeferredQueue::new(5);
        store.hydrate(&reloaded, &fresh_queue);
        assert_eq!(reloaded.snapshot(), before);
    }

    #[test]
    fn test_corrupt_state_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let store = StateStore::new(&path);
        let ledger = QuotaLedger::new(Config::default());
        let queue = DeferredQueue::new(5);
        store.hydrate(&ledger, &queue); // must not panic
        assert!(ledger.snapshot().is_empty());
    }

    #[test]
    fn test_save_overwrites_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let state_a = PersistedState {
            version: STATE_VERSION,
            ..PersistedState::default()
        };
        store.save(&state_a).unwrap();
        store.save(&state_a).unwrap();
        // No stray temp files left behind.
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1, "only the state file should remain: {entries:?}");
    }

    #[test]
    fn test_deferred_fifo_survives_persistence() {
        use crate::context::TaskContext;
        use crate::deferred::DeferReason;
        use crate::model::{Candidate, ScoredCandidate, Scores};
        use std::path::PathBuf;

        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let queue = DeferredQueue::new(5);
        let at = Utc::now() - chrono::Duration::minutes(1);
        for n in 0..3 {
            queue.defer(
                TaskContext {
                    work_id: format!("w{n}"),
                    entry_id: format!("E{n}"),
                    provider_key: "annas".to_string(),
                    name_stem: format!("e{n}"),
                    work_dir: PathBuf::from(format!("/out/e{n}")),
                },
                format!("title {n}"),
                ScoredCandidate {
                    candidate: Candidate::new("annas", "Annas", "t", format!("s{n}")),
                    scores: Scores {
                        title_score: 90,
                        creator_score: 100,
                        quality_bonus: 0.0,
                        total: 92.0,
                    },
                },
                vec![],
                DeferReason::Quota,
                at,
            );
        }
        store.flush(&QuotaLedger::new(Config::default()), &queue).unwrap();

        let restored = DeferredQueue::new(5);
        store.hydrate(&QuotaLedger::new(Config::default()), &restored);
        let order: Vec<String> = restored
            .take_ready(Utc::now(), 10)
            .into_iter()
            .map(|i| i.title)
            .collect();
        assert_eq!(order, vec!["title 0", "title 1", "title 2"]);
    }
}
