//! Provider adapters: the pluggable edge of the pipeline.
//!
//! A provider is described by a capability set — [`ProviderInfo`] plus the
//! [`ProviderAdapter`] trait's `search` and `download` — resolved through a
//! [`ProviderRegistry`] keyed by provider key. Adapters route every HTTP
//! call through the shared [`HttpExecutor`] so pacing, breaker, retry and
//! budget policy apply uniformly, and they hold no state of their own
//! between calls.

mod gallica;
pub mod iiif;
mod internet_archive;

pub use gallica::GallicaAdapter;
pub use internet_archive::InternetArchiveAdapter;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::budget::ContentClass;
use crate::config::Config;
use crate::context::TaskContext;
use crate::model::{Candidate, DownloadOutcome};
use crate::naming::ArtifactNamer;
use crate::net::{FetchError, HttpExecutor};

/// Static description of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderInfo {
    /// Machine key used in configuration, naming, and the journal.
    pub key: &'static str,
    /// Human-readable name for logs and `index.csv`.
    pub display_name: &'static str,
}

/// Per-download options derived from configuration.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub prefer_pdf_over_images: bool,
    pub download_manifest_renderings: bool,
    pub max_renderings_per_manifest: usize,
    pub rendering_mime_whitelist: Vec<String>,
    pub overwrite_existing: bool,
    pub include_metadata: bool,
    /// Accepted object extensions; empty means any.
    pub allowed_extensions: Vec<String>,
    /// Page image cap; `None` means all pages.
    pub max_pages: Option<usize>,
}

impl DownloadOptions {
    /// Builds options for one provider from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config, provider_key: &str) -> Self {
        let dl = &config.download;
        Self {
            prefer_pdf_over_images: dl.prefer_pdf_over_images,
            download_manifest_renderings: dl.download_manifest_renderings,
            max_renderings_per_manifest: dl.max_renderings_per_manifest,
            rendering_mime_whitelist: dl.rendering_mime_whitelist.clone(),
            overwrite_existing: dl.overwrite_existing,
            include_metadata: dl.include_metadata,
            allowed_extensions: dl.allowed_object_extensions.clone(),
            max_pages: config.max_pages(provider_key),
        }
    }

    fn extension_allowed(&self, ext: &str) -> bool {
        self.allowed_extensions.is_empty()
            || self
                .allowed_extensions
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(ext))
    }
}

/// Contract every provider adapter implements.
///
/// `search` must be side-effect-free beyond HTTP routed through the
/// executor and returns at most `max_results` candidates. `download`
/// writes artifacts under the work directory carried by `ctx` and reports
/// what it wrote.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Static identity of this provider.
    fn info(&self) -> ProviderInfo;

    /// Searches the provider for candidates matching the query.
    async fn search(
        &self,
        executor: &HttpExecutor,
        title: &str,
        creator: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<Candidate>, FetchError>;

    /// Downloads the candidate's artifacts into the work directory.
    async fn download(
        &self,
        executor: &HttpExecutor,
        candidate: &Candidate,
        ctx: &TaskContext,
        namer: &mut ArtifactNamer,
        options: &DownloadOptions,
    ) -> Result<DownloadOutcome, FetchError>;
}

/// Registry resolving provider keys to adapters.
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: BTreeMap<String, Arc<dyn ProviderAdapter>>,
    registration_order: Vec<String>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under its own key.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        let key = adapter.info().key.to_string();
        if self.adapters.insert(key.clone(), adapter).is_none() {
            self.registration_order.push(key);
        }
    }

    /// Adapter for a key, if registered.
    #[must_use]
    pub fn get(&self, provider_key: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider_key).cloned()
    }

    /// Enabled adapters in hierarchy order.
    ///
    /// Providers listed in `selection.provider_hierarchy` come first in
    /// that order; remaining enabled providers follow in registration
    /// order. Enabled providers without a registered adapter are skipped
    /// with a warning.
    #[must_use]
    pub fn enabled_adapters(&self, config: &Config) -> Vec<Arc<dyn ProviderAdapter>> {
        let enabled = config.enabled_provider_keys();
        let mut ordered_keys = Vec::new();
        for key in &config.selection.provider_hierarchy {
            if enabled.contains(key) && !ordered_keys.contains(key) {
                ordered_keys.push(key.clone());
            }
        }
        for key in &self.registration_order {
            if enabled.contains(key) && !ordered_keys.contains(key) {
                ordered_keys.push(key.clone());
            }
        }

        let mut adapters = Vec::new();
        for key in ordered_keys {
            match self.get(&key) {
                Some(adapter) => adapters.push(adapter),
                None => warn!(provider = %key, "enabled provider has no adapter; skipping"),
            }
        }
        adapters
    }
}

/// Builds the registry with the built-in adapters.
#[must_use]
pub fn build_default_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(InternetArchiveAdapter::new()));
    registry.register(Arc::new(GallicaAdapter::new()));
    registry
}

/// Saves a JSON metadata payload into the work's `metadata/` directory,
/// counting it against the metadata budget.
pub(crate) async fn save_metadata_json(
    executor: &HttpExecutor,
    ctx: &TaskContext,
    namer: &mut ArtifactNamer,
    value: &serde_json::Value,
    options: &DownloadOptions,
) -> Result<Option<PathBuf>, FetchError> {
    if !options.include_metadata {
        return Ok(None);
    }
    let body = serde_json::to_vec_pretty(value).map_err(|e| FetchError::BadPayload {
        url: String::new(),
        detail: format!("metadata serialization failed: {e}"),
    })?;
    executor
        .budget()
        .reserve(ContentClass::Metadata, Some(&ctx.work_id), body.len() as u64)?;

    let dir = ctx.metadata_dir();
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| FetchError::io(&dir, e))?;
    let path = dir.join(namer.next_metadata(&ctx.provider_key));
    tokio::fs::write(&path, &body)
        .await
        .map_err(|e| FetchError::io(&path, e))?;

    executor
        .budget()
        .account(ContentClass::Metadata, Some(&ctx.work_id), body.len() as u64);
    executor.budget().commit_file(ContentClass::Metadata, Some(&ctx.work_id));
    debug!(path = %path.display(), "saved metadata");
    Ok(Some(path))
}

/// Downloads manifest-level renderings (bundled PDFs/EPUBs).
///
/// Returns the number of renderings written; artifacts land in
/// `objects/`.
pub(crate) async fn download_renderings(
    executor: &HttpExecutor,
    ctx: &TaskContext,
    namer: &mut ArtifactNamer,
    manifest: &serde_json::Value,
    options: &DownloadOptions,
    outcome: &mut DownloadOutcome,
) -> Result<usize, FetchError> {
    if !options.download_manifest_renderings {
        return Ok(0);
    }
    let renderings = iiif::extract_renderings(
        manifest,
        &options.rendering_mime_whitelist,
        options.max_renderings_per_manifest,
    );

    let mut written = 0;
    for rendering in renderings {
        let ext = rendering.extension();
        if !options.extension_allowed(ext) {
            debug!(url = %rendering.url, ext, "rendering extension not allowed");
            continue;
        }
        let dest = ctx.objects_dir().join(namer.next_object(&ctx.provider_key, ext));
        if dest.exists() && !options.overwrite_existing {
            debug!(path = %dest.display(), "rendering already present, skipping");
            outcome.skipped_reason = Some("already-exists".to_string());
            continue;
        }
        let bytes = executor
            .download_to_file(
                &ctx.provider_key,
                &rendering.url,
                &dest,
                ContentClass::Pdf,
                Some(&ctx.work_id),
            )
            .await?;
        outcome.files_written.push(dest);
        outcome.bytes_written += bytes;
        written += 1;
    }
    if written > 0 {
        info!(count = written, "downloaded manifest renderings");
    }
    Ok(written)
}

/// Downloads page images from Image API service bases, up to `max_pages`.
///
/// Per-page failures with another URL spelling left to try are tolerated;
/// budget violations and open circuits abort the whole batch.
pub(crate) async fn download_page_images(
    executor: &HttpExecutor,
    ctx: &TaskContext,
    namer: &mut ArtifactNamer,
    service_bases: &[String],
    options: &DownloadOptions,
    outcome: &mut DownloadOutcome,
) -> Result<usize, FetchError> {
    if !options.extension_allowed("jpg") {
        return Ok(0);
    }
    let total = service_bases.len();
    let capped: &[String] = match options.max_pages {
        Some(max) if max < total => &service_bases[..max],
        _ => service_bases,
    };
    if capped.len() < total {
        info!(downloading = capped.len(), total, "page count capped by configuration");
    }

    let mut written = 0;
    for base in capped {
        let dest = ctx.objects_dir().join(namer.next_image(&ctx.provider_key, "jpg"));
        if dest.exists() && !options.overwrite_existing {
            outcome.skipped_reason = Some("already-exists".to_string());
            continue;
        }
        let mut page_done = false;
        for url in iiif::image_url_candidates(base) {
            match executor
                .download_to_file(
                    &ctx.provider_key,
                    &url,
                    &dest,
                    ContentClass::Image,
                    Some(&ctx.work_id),
                )
                .await
            {
                Ok(bytes) => {
                    outcome.files_written.push(dest.clone());
                    outcome.bytes_written += bytes;
                    written += 1;
                    page_done = true;
                    break;
                }
                // Another size/quality spelling may still work.
                Err(FetchError::ClientError { .. }) => continue,
                Err(error @ (FetchError::BudgetExceeded(_) | FetchError::CircuitOpen { .. })) => {
                    return Err(error);
                }
                Err(error) => {
                    warn!(url, %error, "page image download failed");
                    break;
                }
            }
        }
        if !page_done {
            debug!(base = %base, "no image URL variant worked for this page");
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_by_key() {
        let registry = build_default_registry();
        assert!(registry.get("ia").is_some());
        assert!(registry.get("gallica").is_some());
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_enabled_adapters_follow_hierarchy() {
        let registry = build_default_registry();
        let mut config = Config::default();
        config.providers.insert("ia".to_string(), true);
        config.providers.insert("gallica".to_string(), true);
        config.selection.provider_hierarchy = vec!["gallica".to_string(), "ia".to_string()];

        let keys: Vec<&str> = registry
            .enabled_adapters(&config)
            .iter()
            .map(|a| a.info().key)
            .collect();
        assert_eq!(keys, vec!["gallica", "ia"]);
    }

    #[test]
    fn test_enabled_adapters_appends_unlisted() {
        let registry = build_default_registry();
        let mut config = Config::default();
        config.providers.insert("ia".to_string(), true);
        config.providers.insert("gallica".to_string(), true);
        config.selection.provider_hierarchy = vec!["gallica".to_string()];

        let keys: Vec<&str> = registry
            .enabled_adapters(&config)
            .iter()
            .map(|a| a.info().key)
            .collect();
        assert_eq!(keys, vec!["gallica", "ia"]);
    }

    #[test]
    fn test_disabled_providers_excluded() {
        let registry = build_default_registry();
        let mut config = Config::default();
        config.providers.insert("ia".to_string(), true);
        config.providers.insert("gallica".to_string(), false);

        let keys: Vec<&str> = registry
            .enabled_adapters(&config)
            .iter()
            .map(|a| a.info().key)
            .collect();
        assert_eq!(keys, vec!["ia"]);
    }

    #[test]
    fn test_download_options_extension_filter() {
        let options = DownloadOptions {
            prefer_pdf_over_images: true,
            download_manifest_renderings: true,
            max_renderings_per_manifest: 1,
            rendering_mime_whitelist: vec![],
            overwrite_existing: false,
            include_metadata: true,
            allowed_extensions: vec!["pdf".to_string()],
            max_pages: None,
        };
        assert!(options.extension_allowed("pdf"));
        assert!(options.extension_allowed("PDF"));
        assert!(!options.extension_allowed("jpg"));

        let open = DownloadOptions {
            allowed_extensions: vec![],
            ..options
        };
        assert!(open.extension_allowed("anything"));
    }
}
