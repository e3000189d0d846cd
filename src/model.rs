//! Core data model: input records, candidates, selections, and works.
//!
//! These types flow through the whole pipeline: the input CSV produces
//! [`InputRecord`]s, provider adapters produce [`Candidate`]s, the selector
//! turns them into a [`Selection`], and the journal persists the resulting
//! [`Work`] as `work.json`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::matching::normalize_text;

/// One row of the user-facing input CSV.
///
/// `extra_columns` preserves everything the pipeline does not interpret so
/// in-place rewrites never lose data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputRecord {
    pub entry_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_columns: BTreeMap<String, String>,
}

impl InputRecord {
    /// Creates a record with just the required fields.
    #[must_use]
    pub fn new(entry_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            title: title.into(),
            creator: None,
            year: None,
            extra_columns: BTreeMap::new(),
        }
    }

    /// Free-form date text carried by the input's extra columns, if any.
    #[must_use]
    pub fn date_hint(&self) -> Option<String> {
        self.extra_columns
            .get("year")
            .or_else(|| self.extra_columns.get("earliest_year"))
            .cloned()
    }

    /// Stable work id derived from entry id and normalized title.
    #[must_use]
    pub fn work_id(&self) -> String {
        let norm = format!("{}|{}", self.entry_id, normalize_text(&self.title));
        let digest = Sha256::digest(norm.as_bytes());
        let mut hex = String::with_capacity(12);
        for byte in digest.iter().take(6) {
            use std::fmt::Write;
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }
}

/// A specific item a provider claims satisfies the query.
///
/// `source_id` uniquely identifies the item within `provider_key`.
/// `download_hint` is opaque provider-specific data handed back to the same
/// adapter at download time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub provider_key: String,
    pub provider_display_name: String,
    pub title: String,
    #[serde(default)]
    pub creators: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iiif_manifest_url: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub download_hint: serde_json::Value,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub raw_metadata: serde_json::Value,
}

impl Candidate {
    /// Creates a candidate with the required identity fields.
    #[must_use]
    pub fn new(
        provider_key: impl Into<String>,
        provider_display_name: impl Into<String>,
        title: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            provider_key: provider_key.into(),
            provider_display_name: provider_display_name.into(),
            title: title.into(),
            creators: Vec::new(),
            date: None,
            source_id: source_id.into(),
            item_url: None,
            iiif_manifest_url: None,
            download_hint: serde_json::Value::Null,
            raw_metadata: serde_json::Value::Null,
        }
    }
}

/// Match scores attached to a candidate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Scores {
    pub title_score: u8,
    pub creator_score: u8,
    pub quality_bonus: f64,
    pub total: f64,
}

/// A candidate together with its match scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredCandidate {
    #[serde(flatten)]
    pub candidate: Candidate,
    pub scores: Scores,
}

/// Why a candidate was excluded from selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedCandidate {
    pub provider_key: String,
    pub source_id: String,
    pub reason: String,
}

/// The chosen primary candidate plus the ordered fallback list.
#[derive(Debug, Clone)]
pub struct Selection {
    pub primary: ScoredCandidate,
    pub fallbacks: Vec<ScoredCandidate>,
    pub rejected: Vec<RejectedCandidate>,
}

/// Terminal and transitional states of a work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Completed,
    Failed,
    Deferred,
    NoMatch,
}

impl WorkStatus {
    /// Whether this status ends the work's lifecycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Deferred)
    }

    /// Stable string used in `index.csv` and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Deferred => "deferred",
            Self::NoMatch => "no_match",
        }
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the `work.json` history trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub at: DateTime<Utc>,
    pub event: String,
}

/// Summary of the selected candidate persisted in `work.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedSummary {
    pub provider: String,
    pub provider_key: String,
    pub source_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_url: Option<String>,
}

impl From<&ScoredCandidate> for SelectedSummary {
    fn from(sc: &ScoredCandidate) -> Self {
        Self {
            provider: sc.candidate.provider_display_name.clone(),
            provider_key: sc.candidate.provider_key.clone(),
            source_id: sc.candidate.source_id.clone(),
            title: sc.candidate.title.clone(),
            item_url: sc.candidate.item_url.clone(),
        }
    }
}

/// The persisted per-work document (`work.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Work {
    pub input: InputRecord,
    pub work_id: String,
    pub work_dir: PathBuf,
    #[serde(default)]
    pub candidates: Vec<ScoredCandidate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<SelectedSummary>,
    pub status: WorkStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<HistoryEvent>,
}

impl Work {
    /// Creates a fresh pending work.
    #[must_use]
    pub fn new(input: InputRecord, work_dir: PathBuf) -> Self {
        let work_id = input.work_id();
        let now = Utc::now();
        Self {
            input,
            work_id,
            work_dir,
            candidates: Vec::new(),
            rejected: Vec::new(),
            selected: None,
            status: WorkStatus::Pending,
            created_at: now,
            updated_at: now,
            history: vec![HistoryEvent {
                at: now,
                event: "created".to_string(),
            }],
        }
    }

    /// Records a status transition with a timestamped history entry.
    pub fn transition(&mut self, status: WorkStatus, event: impl Into<String>) {
        self.status = status;
        self.updated_at = Utc::now();
        self.history.push(HistoryEvent {
            at: self.updated_at,
            event: event.into(),
        });
    }

    /// Appends a history entry without changing status.
    pub fn record_event(&mut self, event: impl Into<String>) {
        self.updated_at = Utc::now();
        self.history.push(HistoryEvent {
            at: self.updated_at,
            event: event.into(),
        });
    }
}

/// Result of a provider adapter's download operation.
#[derive(Debug, Default, Clone)]
pub struct DownloadOutcome {
    pub files_written: Vec<PathBuf>,
    pub bytes_written: u64,
    pub skipped_reason: Option<String>,
}

impl DownloadOutcome {
    /// Whether at least one artifact was written.
    #[must_use]
    pub fn any_written(&self) -> bool {
        !self.files_written.is_empty()
    }

    /// Merges another outcome into this one.
    pub fn absorb(&mut self, other: DownloadOutcome) {
        self.files_written.extend(other.files_written);
        self.bytes_written += other.bytes_written;
        if self.skipped_reason.is_none() {
            self.skipped_reason = other.skipped_reason;
        }
    }
}
