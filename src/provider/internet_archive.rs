//! Internet Archive adapter.
//!
//! Search goes through the Advanced Search API; downloads prefer, in
//! order: manifest-level IIIF renderings (bundled PDF/EPUB), direct files
//! from the item's metadata listing (PDF, then EPUB, then DjVu), and
//! finally page images via the IIIF Image API.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{
    download_page_images, download_renderings, iiif, save_metadata_json, DownloadOptions,
    ProviderAdapter, ProviderInfo,
};
use crate::budget::ContentClass;
use crate::context::TaskContext;
use crate::model::{Candidate, DownloadOutcome};
use crate::naming::ArtifactNamer;
use crate::net::{FetchError, HttpExecutor};

const SEARCH_URL: &str = "https://archive.org/advancedsearch.php";
const METADATA_URL: &str = "https://archive.org/metadata";
const DOWNLOAD_URL: &str = "https://archive.org/download";
const DETAILS_URL: &str = "https://archive.org/details";

/// Direct-file extensions tried in preference order.
const PREFERRED_EXTENSIONS: [&str; 3] = ["pdf", "epub", "djvu"];

/// Adapter for archive.org.
#[derive(Debug, Default)]
pub struct InternetArchiveAdapter;

impl InternetArchiveAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn manifest_candidates(identifier: &str, metadata: &Value) -> Vec<String> {
        if let Some(url) = metadata
            .get("misc")
            .and_then(|m| m.get("ia_iiif_url"))
            .and_then(Value::as_str)
        {
            return vec![url.to_string()];
        }
        vec![
            format!("https://iiif.archivelab.org/iiif/{identifier}/manifest.json"),
            format!("https://iiif.archive.org/iiif/{identifier}/manifest.json"),
        ]
    }

    fn file_url(identifier: &str, name: &str) -> Option<String> {
        let mut url = url::Url::parse(DOWNLOAD_URL).ok()?;
        url.path_segments_mut()
            .ok()?
            .push(identifier)
            .push(name);
        Some(url.to_string())
    }

    /// Picks the first listed file matching an extension, in the metadata
    /// listing's own order.
    fn find_file_with_extension<'a>(files: &'a [Value], ext: &str) -> Option<&'a str> {
        let suffix = format!(".{ext}");
        files.iter().find_map(|file| {
            let name = file
                .get("name")
                .or_else(|| file.get("file"))
                .and_then(Value::as_str)?;
            let format = file
                .get("format")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_lowercase();
            (name.to_lowercase().ends_with(&suffix) || format.contains(ext)).then_some(name)
        })
    }
}

#[async_trait]
impl ProviderAdapter for InternetArchiveAdapter {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            key: "ia",
            display_name: "Internet Archive",
        }
    }

    #[instrument(skip(self, executor), fields(provider = "ia"))]
    async fn search(
        &self,
        executor: &HttpExecutor,
        title: &str,
        creator: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<Candidate>, FetchError> {
        let mut query_parts = vec![format!("title:(\"{}\")", title.replace('"', " "))];
        if let Some(creator) = creator {
            query_parts.push(format!("creator:(\"{}\")", creator.replace('"', " ")));
        }
        query_parts.push("mediatype:(texts)".to_string());
        let query = query_parts.join(" AND ");

        let mut url = url::Url::parse(SEARCH_URL).map_err(|_| FetchError::InvalidUrl {
            url: SEARCH_URL.to_string(),
        })?;
        url.query_pairs_mut()
            .append_pair("q", &query)
            .append_pair("fl[]", "identifier,title,creator,year")
            .append_pair("rows", &max_results.to_string())
            .append_pair("page", "1")
            .append_pair("output", "json");

        info!(title, "searching Internet Archive");
        let payload = executor.get_json(self.info().key, url.as_str()).await?;

        let docs = payload
            .get("response")
            .and_then(|r| r.get("docs"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut candidates = Vec::new();
        for doc in docs.iter().take(max_results) {
            let Some(identifier) = doc.get("identifier").and_then(Value::as_str) else {
                continue;
            };
            let mut candidate = Candidate::new(
                self.info().key,
                self.info().display_name,
                doc.get("title").and_then(Value::as_str).unwrap_or("N/A"),
                identifier,
            );
            candidate.creators = match doc.get("creator") {
                Some(Value::String(one)) => vec![one.clone()],
                Some(Value::Array(many)) => many
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                _ => Vec::new(),
            };
            candidate.date = doc.get("year").map(|y| match y {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
            candidate.item_url = Some(format!("{DETAILS_URL}/{identifier}"));
            candidate.raw_metadata = doc.clone();
            candidates.push(candidate);
        }
        debug!(count = candidates.len(), "Internet Archive search done");
        Ok(candidates)
    }

    #[instrument(skip_all, fields(provider = "ia", source_id = %candidate.source_id))]
    async fn download(
        &self,
        executor: &HttpExecutor,
        candidate: &Candidate,
        ctx: &TaskContext,
        namer: &mut ArtifactNamer,
        options: &DownloadOptions,
    ) -> Result<DownloadOutcome, FetchError> {
        let identifier = &candidate.source_id;
        let mut outcome = DownloadOutcome::default();

        let metadata_url = format!("{METADATA_URL}/{identifier}");
        info!(url = %metadata_url, "fetching Internet Archive metadata");
        let metadata = executor.get_json(self.info().key, &metadata_url).await?;
        save_metadata_json(executor, ctx, namer, &metadata, options).await?;

        // Manifest-level renderings first: one bundled PDF beats hundreds
        // of page requests.
        let mut manifest: Option<Value> = None;
        for url in Self::manifest_candidates(identifier, &metadata) {
            match executor.get_json(self.info().key, &url).await {
                Ok(value) => {
                    manifest = Some(value);
                    break;
                }
                Err(FetchError::ClientError { .. } | FetchError::BadPayload { .. }) => continue,
                Err(error) => {
                    warn!(url, %error, "manifest fetch failed");
                    break;
                }
            }
        }

        let mut primary_obtained = false;
        if let Some(manifest) = &manifest {
            save_metadata_json(executor, ctx, namer, manifest, options).await?;
            let rendered =
                download_renderings(executor, ctx, namer, manifest, options, &mut outcome).await?;
            if rendered > 0 {
                primary_obtained = true;
                if options.prefer_pdf_over_images {
                    return Ok(outcome);
                }
            }
        }

        // Direct files listed in the item metadata, best format first.
        if !primary_obtained {
            if let Some(files) = metadata.get("files").and_then(Value::as_array) {
                for ext in PREFERRED_EXTENSIONS {
                    if !options
                        .allowed_extensions
                        .iter()
                        .any(|a| a.eq_ignore_ascii_case(ext))
                        && !options.allowed_extensions.is_empty()
                    {
                        continue;
                    }
                    let Some(name) = Self::find_file_with_extension(files, ext) else {
                        continue;
                    };
                    let Some(file_url) = Self::file_url(identifier, name) else {
                        continue;
                    };
                    let dest = ctx
                        .objects_dir()
                        .join(namer.next_object(&ctx.provider_key, ext));
                    if dest.exists() && !options.overwrite_existing {
                        outcome.skipped_reason = Some("already-exists".to_string());
                        primary_obtained = true;
                        break;
                    }
                    match executor
                        .download_to_file(
                            &ctx.provider_key,
                            &file_url,
                            &dest,
                            ContentClass::Pdf,
                            Some(&ctx.work_id),
                        )
                        .await
                    {
                        Ok(bytes) => {
                            outcome.files_written.push(dest);
                            outcome.bytes_written += bytes;
                            primary_obtained = true;
                            break;
                        }
                        Err(FetchError::ClientError { .. }) => continue,
                        Err(error) => return Err(error),
                    }
                }
            }
        }

        if primary_obtained && options.prefer_pdf_over_images {
            return Ok(outcome);
        }

        // Page images as the fallback object form.
        if let Some(manifest) = &manifest {
            let bases = iiif::extract_image_service_bases(manifest);
            if !bases.is_empty() {
                download_page_images(executor, ctx, namer, &bases, options, &mut outcome).await?;
            }
        }

        if !outcome.any_written() && outcome.skipped_reason.is_none() {
            outcome.skipped_reason = Some("no-downloadable-artifacts".to_string());
        }
        Ok(outcome)
    }
}
