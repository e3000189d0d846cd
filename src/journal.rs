//! Work journal: the on-disk record of every processed work.
//!
//! Owns the deterministic output layout (one directory per work), the
//! `work.json` document, and the shared `index.csv`. The index is append
//! only and mutated exclusively under this journal's lock; `work.json`
//! writes stage to a temp file and rename into place so a crash never
//! leaves a torn document.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::{NamingConfig, ResumeMode};
use crate::input;
use crate::matching::parse_year;
use crate::model::{InputRecord, Work, WorkStatus};
use crate::naming::{work_dir_name, work_stem};

/// Errors from journal persistence.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("failed to create work directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize work.json: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("index.csv error: {0}")]
    Index(#[from] csv::Error),
}

/// Columns of `index.csv`, in order.
const INDEX_COLUMNS: [&str; 12] = [
    "work_id",
    "entry_id",
    "work_dir",
    "title",
    "creator",
    "selected_provider",
    "selected_provider_key",
    "selected_source_id",
    "selected_dir",
    "work_json",
    "item_url",
    "status",
];

/// One logical row of the index.
#[derive(Debug, Clone, Default)]
pub struct IndexRow {
    pub work_id: String,
    pub entry_id: String,
    pub work_dir: String,
    pub title: String,
    pub creator: String,
    pub selected_provider: String,
    pub selected_provider_key: String,
    pub selected_source_id: String,
    pub selected_dir: String,
    pub work_json: String,
    pub item_url: String,
    pub status: String,
}

impl IndexRow {
    /// Builds the index row for a work's current state.
    #[must_use]
    pub fn for_work(work: &Work) -> Self {
        let selected = work.selected.as_ref();
        Self {
            work_id: work.work_id.clone(),
            entry_id: work.input.entry_id.clone(),
            work_dir: work.work_dir.display().to_string(),
            title: work.input.title.clone(),
            creator: work.input.creator.clone().unwrap_or_default(),
            selected_provider: selected.map(|s| s.provider.clone()).unwrap_or_default(),
            selected_provider_key: selected.map(|s| s.provider_key.clone()).unwrap_or_default(),
            selected_source_id: selected.map(|s| s.source_id.clone()).unwrap_or_default(),
            selected_dir: selected
                .map(|_| work.work_dir.display().to_string())
                .unwrap_or_default(),
            work_json: work.work_dir.join("work.json").display().to_string(),
            item_url: selected
                .and_then(|s| s.item_url.clone())
                .unwrap_or_default(),
            status: work.status.as_str().to_string(),
        }
    }

    fn value_for(&self, column: &str) -> &str {
        match column {
            "work_id" => &self.work_id,
            "entry_id" => &self.entry_id,
            "work_dir" => &self.work_dir,
            "title" => &self.title,
            "creator" => &self.creator,
            "selected_provider" => &self.selected_provider,
            "selected_provider_key" => &self.selected_provider_key,
            "selected_source_id" => &self.selected_source_id,
            "selected_dir" => &self.selected_dir,
            "work_json" => &self.work_json,
            "item_url" => &self.item_url,
            "status" => &self.status,
            _ => "",
        }
    }
}

/// The journal over one output root.
#[derive(Debug)]
pub struct WorkJournal {
    output_root: PathBuf,
    naming: NamingConfig,
    index_lock: Mutex<()>,
}

impl WorkJournal {
    /// Creates a journal rooted at `output_root`.
    #[must_use]
    pub fn new(output_root: impl Into<PathBuf>, naming: NamingConfig) -> Self {
        Self {
            output_root: output_root.into(),
            naming,
            index_lock: Mutex::new(()),
        }
    }

    /// The output root directory.
    #[must_use]
    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Path of the shared index file.
    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.output_root.join("index.csv")
    }

    /// Deterministic work directory for an input record.
    #[must_use]
    pub fn work_dir_for(&self, record: &InputRecord) -> PathBuf {
        let year = record
            .year
            .or_else(|| record.date_hint().as_deref().and_then(parse_year));
        self.output_root.join(work_dir_name(
            &record.entry_id,
            &record.title,
            record.creator.as_deref(),
            year,
            &self.naming,
        ))
    }

    /// Shared artifact name stem for an input record.
    #[must_use]
    pub fn stem_for(&self, record: &InputRecord) -> String {
        work_stem(&record.entry_id, &record.title, &self.naming)
    }

    /// Creates the work directory tree.
    pub fn create_work_dir(&self, work_dir: &Path) -> Result<(), JournalError> {
        std::fs::create_dir_all(work_dir).map_err(|source| JournalError::CreateDir {
            path: work_dir.to_path_buf(),
            source,
        })
    }

    /// Persists `work.json` atomically.
    #[instrument(skip(self, work), fields(work_id = %work.work_id, status = %work.status))]
    pub fn write_work(&self, work: &Work) -> Result<(), JournalError> {
        self.create_work_dir(&work.work_dir)?;
        let path = work.work_dir.join("work.json");
        let body = serde_json::to_vec_pretty(work)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&work.work_dir).map_err(|source| {
            JournalError::Write {
                path: path.clone(),
                source,
            }
        })?;
        tmp.write_all(&body).map_err(|source| JournalError::Write {
            path: path.clone(),
            source,
        })?;
        tmp.persist(&path).map_err(|e| JournalError::Write {
            path: path.clone(),
            source: e.error,
        })?;
        debug!(path = %path.display(), "wrote work.json");
        Ok(())
    }

    /// Loads a previously persisted work document, if present and readable.
    #[must_use]
    pub fn read_work(&self, work_dir: &Path) -> Option<Work> {
        let path = work_dir.join("work.json");
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(work) => Some(work),
            Err(error) => {
                warn!(path = %path.display(), %error, "unreadable work.json");
                None
            }
        }
    }

    /// Appends one row to `index.csv` under the journal lock.
    ///
    /// A header is written when the file does not exist. When an existing
    /// file carries extra columns, our row is projected onto that header
    /// so the file stays rectangular.
    pub fn append_index(&self, row: &IndexRow) -> Result<(), JournalError> {
        let _guard = match self.index_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::fs::create_dir_all(&self.output_root).map_err(|source| JournalError::Write {
            path: self.output_root.clone(),
            source,
        })?;

        let path = self.index_path();
        let existing_header: Option<Vec<String>> = if path.exists() {
            let mut reader = csv::Reader::from_path(&path)?;
            Some(
                reader
                    .headers()?
                    .iter()
                    .map(str::to_string)
                    .collect::<Vec<_>>(),
            )
        } else {
            None
        };

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| JournalError::Write {
                path: path.clone(),
                source,
            })?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        match existing_header {
            Some(header) if !header.is_empty() => {
                let record: Vec<&str> = header.iter().map(|col| row.value_for(col)).collect();
                writer.write_record(record)?;
            }
            _ => {
                writer.write_record(INDEX_COLUMNS)?;
                let record: Vec<&str> = INDEX_COLUMNS.iter().map(|col| row.value_for(col)).collect();
                writer.write_record(record)?;
            }
        }
        writer.flush().map_err(|source| JournalError::Write {
            path: path.clone(),
            source,
        })?;
        info!(entry_id = %row.entry_id, status = %row.status, "index row appended");
        Ok(())
    }

    /// Applies the resume policy to a record. Returns the skip reason when
    /// the record should not be processed again.
    #[must_use]
    pub fn should_skip(&self, record: &InputRecord, resume_mode: ResumeMode) -> Option<String> {
        let work_dir = self.work_dir_for(record);
        match resume_mode {
            ResumeMode::ReprocessAll => None,
            ResumeMode::SkipCompleted => {
                let work = self.read_work(&work_dir)?;
                (work.status == WorkStatus::Completed)
                    .then(|| "work.json reports completed".to_string())
            }
            ResumeMode::SkipIfHasObjects => {
                let objects = work_dir.join("objects");
                let mut entries = std::fs::read_dir(objects).ok()?;
                entries
                    .any(|e| e.map(|e| e.path().is_file()).unwrap_or(false))
                    .then(|| "objects directory already populated".to_string())
            }
            ResumeMode::ResumeFromCsv => input::is_marked_retrievable(record)
                .then(|| "retrievable=True in input".to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn journal(dir: &Path) -> WorkJournal {
        WorkJournal::new(dir, NamingConfig::default())
    }

    fn record() -> InputRecord {
        InputRecord {
            entry_id: "E1".to_string(),
            title: "The Raven".to_string(),
            creator: Some("Poe, Edgar Allan".to_string()),
            year: Some(1845),
            extra_columns: BTreeMap::new(),
        }
    }

    #[test]
    fn test_work_dir_naming() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(dir.path());
        let work_dir = journal.work_dir_for(&record());
        assert_eq!(
            work_dir.file_name().unwrap().to_str().unwrap(),
            "e1_the_raven_poe_edgar_allan_1845"
        );
    }

    #[test]
    fn test_write_and_read_work() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(dir.path());
        let work_dir = journal.work_dir_for(&record());
        let mut work = Work::new(record(), work_dir.clone());
        work.transition(WorkStatus::Completed, "ia:completed");

        journal.write_work(&work).unwrap();
        let loaded = journal.read_work(&work_dir).unwrap();
        assert_eq!(loaded.status, WorkStatus::Completed);
        assert_eq!(loaded.work_id, work.work_id);
        assert_eq!(loaded.history.len(), 2);
    }

    #[test]
    fn test_append_index_creates_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(dir.path());
        let work = Work::new(record(), journal.work_dir_for(&record()));
        journal.append_index(&IndexRow::for_work(&work)).unwrap();

        let mut record2 = record();
        record2.entry_id = "E2".to_string();
        let work2 = Work::new(record2, PathBuf::from("/x"));
        journal.append_index(&IndexRow::for_work(&work2)).unwrap();

        let mut reader = csv::Reader::from_path(journal.index_path()).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(str::to_string).collect();
        assert_eq!(headers, INDEX_COLUMNS.to_vec());
        assert_eq!(reader.records().count(), 2);
    }

    #[test]
    fn test_append_index_row_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(dir.path());
        let mut work = Work::new(record(), journal.work_dir_for(&record()));
        work.status = WorkStatus::NoMatch;
        journal.append_index(&IndexRow::for_work(&work)).unwrap();

        let mut reader = csv::Reader::from_path(journal.index_path()).unwrap();
        let row = reader.records().next().unwrap().unwrap();
        assert_eq!(&row[0], work.work_id.as_str());
        assert_eq!(&row[1], "E1");
        assert_eq!(&row[3], "The Raven");
        assert_eq!(&row[11], "no_match");
    }

    #[test]
    fn test_append_index_tolerates_extra_columns() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(dir.path());
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(
            journal.index_path(),
            "work_id,entry_id,custom_note,status\nw0,E0,hello,completed\n",
        )
        .unwrap();

        let work = Work::new(record(), journal.work_dir_for(&record()));
        journal.append_index(&IndexRow::for_work(&work)).unwrap();

        let mut reader = csv::Reader::from_path(journal.index_path()).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].len(), 4);
        assert_eq!(&rows[1][1], "E1");
        assert_eq!(&rows[1][2], ""); // unknown column left empty
        assert_eq!(&rows[1][3], "pending");
    }

    #[test]
    fn test_should_skip_completed() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(dir.path());
        let work_dir = journal.work_dir_for(&record());

        assert!(journal
            .should_skip(&record(), ResumeMode::SkipCompleted)
            .is_none());

        let mut work = Work::new(record(), work_dir);
        work.transition(WorkStatus::Completed, "done");
        journal.write_work(&work).unwrap();

        assert!(journal
            .should_skip(&record(), ResumeMode::SkipCompleted)
            .is_some());
        assert!(journal
            .should_skip(&record(), ResumeMode::ReprocessAll)
            .is_none());
    }

    #[test]
    fn test_should_skip_failed_is_not_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(dir.path());
        let mut work = Work::new(record(), journal.work_dir_for(&record()));
        work.transition(WorkStatus::Failed, "all candidates failed");
        journal.write_work(&work).unwrap();
        assert!(journal
            .should_skip(&record(), ResumeMode::SkipCompleted)
            .is_none());
    }

    #[test]
    fn test_should_skip_if_has_objects() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(dir.path());
        let work_dir = journal.work_dir_for(&record());

        assert!(journal
            .should_skip(&record(), ResumeMode::SkipIfHasObjects)
            .is_none());

        let objects = work_dir.join("objects");
        std::fs::create_dir_all(&objects).unwrap();
        // Empty directory still processes.
        assert!(journal
            .should_skip(&record(), ResumeMode::SkipIfHasObjects)
            .is_none());

        std::fs::write(objects.join("e1_ia.pdf"), b"pdf").unwrap();
        assert!(journal
            .should_skip(&record(), ResumeMode::SkipIfHasObjects)
            .is_some());
    }

    #[test]
    fn test_should_skip_from_csv_column() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(dir.path());
        let mut r = record();
        assert!(journal.should_skip(&r, ResumeMode::ResumeFromCsv).is_none());
        r.extra_columns
            .insert("retrievable".to_string(), "True".to_string());
        assert!(journal.should_skip(&r, ResumeMode::ResumeFromCsv).is_some());
        r.extra_columns
            .insert("retrievable".to_string(), "False".to_string());
        assert!(journal.should_skip(&r, ResumeMode::ResumeFromCsv).is_none());
    }
}
