//! Deterministic file and directory naming for downloaded works.
//!
//! All artifacts of a work live under a single directory whose name is
//! derived from the input record, so re-runs land in the same place:
//!
//! ```text
//! <output_root>/<entry_id>_<title_slug>[_<creator_slug>][_<year>]/
//!   work.json
//!   metadata/<entry_id>_<title_slug>_<provider_key>[_<n>].json
//!   objects/<entry_id>_<title_slug>_<provider_key>[_<n>].<ext>
//!   objects/<entry_id>_<title_slug>_<provider_key>_image_<NNN>.<ext>
//! ```

use std::collections::HashMap;

use crate::config::NamingConfig;
use crate::matching::fold_diacritics;
use unicode_normalization::UnicodeNormalization;

/// Converts arbitrary text into a filesystem-safe slug.
///
/// NFKC fold, diacritics folded, lowercased; every run of characters
/// outside `[a-z0-9]` becomes a single underscore; leading/trailing
/// underscores are trimmed and the result is capped at `max_len`.
pub fn slugify(text: &str, max_len: usize) -> String {
    let compat: String = text.nfkc().collect();
    let folded = fold_diacritics(&compat).to_lowercase();

    let mut out = String::with_capacity(folded.len());
    let mut pending = false;
    for ch in folded.chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending && !out.is_empty() {
                out.push('_');
            }
            pending = false;
            out.push(ch);
        } else {
            pending = true;
        }
    }

    if max_len > 0 && out.len() > max_len {
        out.truncate(max_len);
    }
    out.trim_matches('_').to_string()
}

/// Name stem shared by a work's directory and its artifact files.
pub fn work_stem(entry_id: &str, title: &str, naming: &NamingConfig) -> String {
    let entry_slug = slugify(entry_id, 0);
    let title_slug = slugify(title, naming.title_slug_max_len);
    match (entry_slug.is_empty(), title_slug.is_empty()) {
        (false, false) => format!("{entry_slug}_{title_slug}"),
        (false, true) => entry_slug,
        (true, false) => title_slug,
        (true, true) => "untitled".to_string(),
    }
}

/// Directory name for a work, optionally extended with creator and year.
pub fn work_dir_name(
    entry_id: &str,
    title: &str,
    creator: Option<&str>,
    year: Option<i32>,
    naming: &NamingConfig,
) -> String {
    let mut name = work_stem(entry_id, title, naming);

    if naming.include_creator_in_work_dir {
        if let Some(creator) = creator {
            let creator_slug = slugify(creator, naming.creator_slug_max_len);
            if !creator_slug.is_empty() {
                name.push('_');
                name.push_str(&creator_slug);
            }
        }
    }
    if naming.include_year_in_work_dir {
        if let Some(year) = year {
            name.push('_');
            name.push_str(&year.to_string());
        }
    }
    name
}

/// Artifact class used for sequence numbering and budget classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Metadata,
    Object,
    Image,
}

/// Assigns collision-free artifact file names within one work.
///
/// The first object of a given provider/extension pair is unnumbered;
/// later ones get `_2`, `_3`, … Page images always carry a zero-padded
/// three-digit counter.
#[derive(Debug)]
pub struct ArtifactNamer {
    stem: String,
    counters: HashMap<(String, ArtifactKind, String), u32>,
}

impl ArtifactNamer {
    /// Creates a namer for one work directory.
    #[must_use]
    pub fn new(stem: impl Into<String>) -> Self {
        Self {
            stem: stem.into(),
            counters: HashMap::new(),
        }
    }

    /// Returns the shared name stem.
    #[must_use]
    pub fn stem(&self) -> &str {
        &self.stem
    }

    fn bump(&mut self, provider_key: &str, kind: ArtifactKind, ext: &str) -> u32 {
        let key = (provider_key.to_string(), kind, ext.to_string());
        let counter = self.counters.entry(key).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Next metadata file name for a provider (`.json`).
    pub fn next_metadata(&mut self, provider_key: &str) -> String {
        let n = self.bump(provider_key, ArtifactKind::Metadata, "json");
        if n == 1 {
            format!("{}_{provider_key}.json", self.stem)
        } else {
            format!("{}_{provider_key}_{n}.json", self.stem)
        }
    }

    /// Next object (bundled document) file name for a provider.
    pub fn next_object(&mut self, provider_key: &str, ext: &str) -> String {
        let n = self.bump(provider_key, ArtifactKind::Object, ext);
        if n == 1 {
            format!("{}_{provider_key}.{ext}", self.stem)
        } else {
            format!("{}_{provider_key}_{n}.{ext}", self.stem)
        }
    }

    /// Next page-image file name for a provider, `_image_NNN` numbered.
    pub fn next_image(&mut self, provider_key: &str, ext: &str) -> String {
        let n = self.bump(provider_key, ArtifactKind::Image, ext);
        format!("{}_{provider_key}_image_{n:03}.{ext}", self.stem)
    }
}

/// Budget content class for a file extension.
#[must_use]
pub fn content_class_for_extension(ext: &str) -> crate::budget::ContentClass {
    use crate::budget::ContentClass;
    match ext.to_ascii_lowercase().as_str() {
        "pdf" | "epub" | "djvu" => ContentClass::Pdf,
        "json" | "xml" => ContentClass::Metadata,
        _ => ContentClass::Image,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::NamingConfig;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("The Raven", 80), "the_raven");
        assert_eq!(slugify("Crónica de España", 80), "cronica_de_espana");
    }

    #[test]
    fn test_slugify_collapses_and_trims() {
        assert_eq!(slugify("--a  b!!c--", 80), "a_b_c");
        assert_eq!(slugify("***", 80), "");
    }

    #[test]
    fn test_slugify_caps_length() {
        let slug = slugify("a very long title that keeps going and going", 12);
        assert!(slug.len() <= 12);
        assert!(!slug.ends_with('_'));
    }

    #[test]
    fn test_slugify_zero_max_is_uncapped() {
        let long = "x".repeat(300);
        assert_eq!(slugify(&long, 0).len(), 300);
    }

    #[test]
    fn test_work_dir_name_full() {
        let naming = NamingConfig::default();
        let name = work_dir_name("E1", "The Raven", Some("Poe, Edgar Allan"), Some(1845), &naming);
        assert_eq!(name, "e1_the_raven_poe_edgar_allan_1845");
    }

    #[test]
    fn test_work_dir_name_flags_off() {
        let naming = NamingConfig {
            include_creator_in_work_dir: false,
            include_year_in_work_dir: false,
            ..NamingConfig::default()
        };
        let name = work_dir_name("E1", "The Raven", Some("Poe"), Some(1845), &naming);
        assert_eq!(name, "e1_the_raven");
    }

    #[test]
    fn test_artifact_namer_sequences_objects() {
        let mut namer = ArtifactNamer::new("e1_the_raven");
        assert_eq!(namer.next_object("ia", "pdf"), "e1_the_raven_ia.pdf");
        assert_eq!(namer.next_object("ia", "pdf"), "e1_the_raven_ia_2.pdf");
        assert_eq!(namer.next_object("ia", "epub"), "e1_the_raven_ia.epub");
        assert_eq!(namer.next_object("gallica", "pdf"), "e1_the_raven_gallica.pdf");
    }

    #[test]
    fn test_artifact_namer_images_zero_padded() {
        let mut namer = ArtifactNamer::new("e1_the_raven");
        assert_eq!(namer.next_image("gallica", "jpg"), "e1_the_raven_gallica_image_001.jpg");
        assert_eq!(namer.next_image("gallica", "jpg"), "e1_the_raven_gallica_image_002.jpg");
    }

    #[test]
    fn test_artifact_namer_metadata() {
        let mut namer = ArtifactNamer::new("e1_the_raven");
        assert_eq!(namer.next_metadata("ia"), "e1_the_raven_ia.json");
        assert_eq!(namer.next_metadata("ia"), "e1_the_raven_ia_2.json");
    }

    #[test]
    fn test_content_class_for_extension() {
        use crate::budget::ContentClass;
        assert_eq!(content_class_for_extension("pdf"), ContentClass::Pdf);
        assert_eq!(content_class_for_extension("EPUB"), ContentClass::Pdf);
        assert_eq!(content_class_for_extension("jpg"), ContentClass::Image);
        assert_eq!(content_class_for_extension("json"), ContentClass::Metadata);
    }
}
