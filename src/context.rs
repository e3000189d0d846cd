//! Task-scoped context carried alongside every download.
//!
//! Adapters and the executor need the entry id, work id, provider key and
//! naming stem for logging and filename generation. The context travels
//! explicitly with the task instead of living in thread-local storage, so
//! a task can hop between worker threads safely.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Identity of the work a download belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskContext {
    pub work_id: String,
    pub entry_id: String,
    pub provider_key: String,
    /// Shared file-name stem for this work's artifacts.
    pub name_stem: String,
    /// Root of the work's directory tree.
    pub work_dir: PathBuf,
}

impl TaskContext {
    /// Returns a copy scoped to a different provider, used when a task
    /// falls back to another candidate.
    #[must_use]
    pub fn for_provider(&self, provider_key: impl Into<String>) -> Self {
        Self {
            provider_key: provider_key.into(),
            ..self.clone()
        }
    }

    /// Directory receiving bundled documents and page images.
    #[must_use]
    pub fn objects_dir(&self) -> PathBuf {
        self.work_dir.join("objects")
    }

    /// Directory receiving provider metadata payloads.
    #[must_use]
    pub fn metadata_dir(&self) -> PathBuf {
        self.work_dir.join("metadata")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TaskContext {
        TaskContext {
            work_id: "abc123".to_string(),
            entry_id: "E1".to_string(),
            provider_key: "ia".to_string(),
            name_stem: "e1_the_raven".to_string(),
            work_dir: PathBuf::from("/out/e1_the_raven"),
        }
    }

    #[test]
    fn test_for_provider_swaps_key_only() {
        let ctx = context();
        let fallback = ctx.for_provider("gallica");
        assert_eq!(fallback.provider_key, "gallica");
        assert_eq!(fallback.work_id, ctx.work_id);
        assert_eq!(fallback.name_stem, ctx.name_stem);
    }

    #[test]
    fn test_directory_layout() {
        let ctx = context();
        assert_eq!(ctx.objects_dir(), PathBuf::from("/out/e1_the_raven/objects"));
        assert_eq!(ctx.metadata_dir(), PathBuf::from("/out/e1_the_raven/metadata"));
    }
}
