//! User-facing input CSV: loading, validation, and in-place status
//! rewrites.
//!
//! The CSV is the operator's file, not ours: every column is preserved
//! verbatim, and only `retrievable` and `link` are mutated as works
//! finish. Rewrites stage to a sibling temp file and rename over the
//! original; a one-time `.bak` copy is taken before the first rewrite of
//! a run.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::matching::parse_year;
use crate::model::InputRecord;

/// Canonical column names, with their accepted aliases.
const ENTRY_ID_COLUMNS: [&str; 1] = ["entry_id"];
const TITLE_COLUMNS: [&str; 2] = ["short_title", "Title"];
const CREATOR_COLUMNS: [&str; 2] = ["main_author", "Creator"];
/// Mutated columns.
pub const RETRIEVABLE_COLUMN: &str = "retrievable";
pub const LINK_COLUMN: &str = "link";

/// Errors from input CSV handling.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to read input CSV {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("input CSV {path} is missing required column(s): {missing}")]
    MissingColumns { path: PathBuf, missing: String },

    #[error("input CSV {path} has duplicate entry_id '{entry_id}'")]
    DuplicateEntryId { path: PathBuf, entry_id: String },

    #[error("input CSV {path} row {row} has an empty {column}")]
    EmptyField {
        path: PathBuf,
        row: usize,
        column: &'static str,
    },

    #[error("failed to write input CSV {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// True when the record's `retrievable` column reads as affirmative.
#[must_use]
pub fn is_marked_retrievable(record: &InputRecord) -> bool {
    record
        .extra_columns
        .get(RETRIEVABLE_COLUMN)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "y"))
        .unwrap_or(false)
}

fn find_column(header: &[String], names: &[&str]) -> Option<usize> {
    names
        .iter()
        .find_map(|name| header.iter().position(|col| col == name))
}

/// The input file with its parsed records.
#[derive(Debug)]
pub struct InputCsv {
    path: PathBuf,
    records: Vec<InputRecord>,
    write_lock: Mutex<bool>, // true once the .bak backup was taken
}

impl InputCsv {
    /// Loads and validates the input file.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, InputError> {
        let path = path.as_ref().to_path_buf();
        let mut reader = csv::Reader::from_path(&path).map_err(|source| InputError::Read {
            path: path.clone(),
            source,
        })?;

        let header: Vec<String> = reader
            .headers()
            .map_err(|source| InputError::Read {
                path: path.clone(),
                source,
            })?
            .iter()
            .map(str::to_string)
            .collect();

        let entry_idx = find_column(&header, &ENTRY_ID_COLUMNS);
        let title_idx = find_column(&header, &TITLE_COLUMNS);
        let mut missing = Vec::new();
        if entry_idx.is_none() {
            missing.push("entry_id");
        }
        if title_idx.is_none() {
            missing.push("short_title/Title");
        }
        if !missing.is_empty() {
            return Err(InputError::MissingColumns {
                path,
                missing: missing.join(", "),
            });
        }
        let (entry_idx, title_idx) = (entry_idx.unwrap_or(0), title_idx.unwrap_or(0));
        let creator_idx = find_column(&header, &CREATOR_COLUMNS);

        let mut records = Vec::new();
        let mut seen = HashSet::new();
        for (row_number, row) in reader.records().enumerate() {
            let row = row.map_err(|source| InputError::Read {
                path: path.clone(),
                source,
            })?;
            let entry_id = row.get(entry_idx).unwrap_or("").trim().to_string();
            if entry_id.is_empty() {
                return Err(InputError::EmptyField {
                    path,
                    row: row_number + 2,
                    column: "entry_id",
                });
            }
            if !seen.insert(entry_id.clone()) {
                return Err(InputError::DuplicateEntryId { path, entry_id });
            }
            let title = row.get(title_idx).unwrap_or("").trim().to_string();
            if title.is_empty() {
                return Err(InputError::EmptyField {
                    path,
                    row: row_number + 2,
                    column: "title",
                });
            }
            let creator = creator_idx
                .and_then(|idx| row.get(idx))
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string);

            let mut extra_columns = BTreeMap::new();
            for (idx, col) in header.iter().enumerate() {
                if idx == entry_idx || idx == title_idx || Some(idx) == creator_idx {
                    continue;
                }
                extra_columns.insert(col.clone(), row.get(idx).unwrap_or("").to_string());
            }

            let year = extra_columns
                .get("year")
                .or_else(|| extra_columns.get("earliest_year"))
                .and_then(|v| parse_year(v));

            records.push(InputRecord {
                entry_id,
                title,
                creator,
                year,
                extra_columns,
            });
        }

        info!(count = records.len(), "loaded input records");
        Ok(Self {
            path,
            records,
            write_lock: Mutex::new(false),
        })
    }

    /// The parsed records, in file order.
    #[must_use]
    pub fn records(&self) -> &[InputRecord] {
        &self.records
    }

    /// The file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Updates `retrievable` and `link` for one entry, rewriting the file
    /// in place (temp + rename). All other columns pass through verbatim;
    /// the two mutated columns are appended to the header when absent.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn mark_result(
        &self,
        entry_id: &str,
        retrievable: bool,
        link: Option<&str>,
    ) -> Result<(), InputError> {
        let mut backed_up = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !*backed_up {
            let backup = self.path.with_extension("csv.bak");
            if let Err(source) = std::fs::copy(&self.path, &backup) {
                return Err(InputError::Write {
                    path: backup,
                    source,
                });
            }
            debug!(backup = %backup.display(), "input CSV backed up");
            *backed_up = true;
        }

        let mut reader = csv::Reader::from_path(&self.path).map_err(|source| InputError::Read {
            path: self.path.clone(),
            source,
        })?;
        let mut header: Vec<String> = reader
            .headers()
            .map_err(|source| InputError::Read {
                path: self.path.clone(),
                source,
            })?
            .iter()
            .map(str::to_string)
            .collect();

        let entry_idx =
            find_column(&header, &ENTRY_ID_COLUMNS).ok_or_else(|| InputError::MissingColumns {
                path: self.path.clone(),
                missing: "entry_id".to_string(),
            })?;
        let retrievable_idx = match header.iter().position(|c| c == RETRIEVABLE_COLUMN) {
            Some(idx) => idx,
            None => {
                header.push(RETRIEVABLE_COLUMN.to_string());
                header.len() - 1
            }
        };
        let link_idx = match header.iter().position(|c| c == LINK_COLUMN) {
            Some(idx) => idx,
            None => {
                header.push(LINK_COLUMN.to_string());
                header.len() - 1
            }
        };

        let mut rows: Vec<Vec<String>> = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|source| InputError::Read {
                path: self.path.clone(),
                source,
            })?;
            let mut cells: Vec<String> = row.iter().map(str::to_string).collect();
            cells.resize(header.len(), String::new());
            if cells.get(entry_idx).map(String::as_str) == Some(entry_id) {
                cells[retrievable_idx] = if retrievable { "True" } else { "False" }.to_string();
                if let Some(link) = link {
                    cells[link_idx] = link.to_string();
                }
            }
            rows.push(cells);
        }

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|source| InputError::Write {
            path: self.path.clone(),
            source,
        })?;
        {
            let mut writer = csv::Writer::from_writer(tmp.as_file_mut());
            writer
                .write_record(&header)
                .and_then(|()| {
                    for row in &rows {
                        writer.write_record(row)?;
                    }
                    Ok(())
                })
                .map_err(|source| InputError::Write {
                    path: self.path.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, source),
                })?;
            writer.flush().map_err(|source| InputError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        tmp.flush().map_err(|source| InputError::Write {
            path: self.path.clone(),
            source,
        })?;
        tmp.persist(&self.path).map_err(|e| InputError::Write {
            path: self.path.clone(),
            source: e.error,
        })?;
        debug!(entry_id, retrievable, "input CSV updated");
        Ok(())
    }
}
