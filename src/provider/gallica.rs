//! BnF Gallica adapter.
//!
//! Search uses the SRU endpoint (Dublin Core records over XML); downloads
//! go through the document's IIIF manifest: bundled renderings when the
//! manifest offers them, page images through the Image API otherwise.

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, info, instrument, warn};

use super::{
    download_page_images, download_renderings, iiif, save_metadata_json, DownloadOptions,
    ProviderAdapter, ProviderInfo,
};
use crate::context::TaskContext;
use crate::model::{Candidate, DownloadOutcome};
use crate::naming::ArtifactNamer;
use crate::net::{FetchError, HttpExecutor};

const SRU_URL: &str = "https://gallica.bnf.fr/SRU";

/// Escapes a literal for SRU/CQL quoted phrases.
fn escape_sru_literal(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace(['\r', '\n', '\t'], " ")
}

/// One Dublin Core record pulled out of the SRU response.
#[derive(Debug, Default, Clone)]
struct DcRecord {
    title: Option<String>,
    creator: Option<String>,
    date: Option<String>,
    ark_id: Option<String>,
}

/// Parses SRU XML into Dublin Core records.
///
/// Only the fields the pipeline uses are read: title, creator, date, and
/// the first identifier carrying an `ark:/12148/` id.
fn parse_sru_records(xml: &str) -> Result<Vec<DcRecord>, FetchError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut records = Vec::new();
    let mut current: Option<DcRecord> = None;
    let mut field: Option<&'static str> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) => {
                let local = start.local_name();
                match local.as_ref() {
                    b"dc" => current = Some(DcRecord::default()),
                    b"title" => field = Some("title"),
                    b"creator" => field = Some("creator"),
                    b"date" => field = Some("date"),
                    b"identifier" => field = Some("identifier"),
                    _ => field = None,
                }
            }
            Ok(Event::Text(text)) => {
                let Some(record) = current.as_mut() else {
                    continue;
                };
                let Ok(value) = text.unescape() else { continue };
                let value = value.trim().to_string();
                if value.is_empty() {
                    continue;
                }
                match field {
                    Some("title") if record.title.is_none() => record.title = Some(value),
                    Some("creator") if record.creator.is_none() => record.creator = Some(value),
                    Some("date") if record.date.is_none() => record.date = Some(value),
                    Some("identifier") if record.ark_id.is_none() => {
                        if let Some(ark) = extract_ark_id(&value) {
                            record.ark_id = Some(ark);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(end)) => {
                if end.local_name().as_ref() == b"dc" {
                    if let Some(record) = current.take() {
                        records.push(record);
                    }
                }
                field = None;
            }
            Ok(Event::Eof) => break,
            Err(error) => {
                return Err(FetchError::BadPayload {
                    url: SRU_URL.to_string(),
                    detail: format!("SRU XML parse error: {error}"),
                });
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(records)
}

/// Pulls the document id out of an `ark:/12148/...` identifier.
fn extract_ark_id(identifier: &str) -> Option<String> {
    let (_, rest) = identifier.split_once("ark:/12148/")?;
    let id: String = rest
        .chars()
        .take_while(|c| *c != '/' && !c.is_whitespace())
        .collect();
    (!id.is_empty()).then_some(id)
}

fn manifest_url(ark_id: &str) -> String {
    format!("https://gallica.bnf.fr/iiif/ark:/12148/{ark_id}/manifest.json")
}

fn item_url(ark_id: &str) -> String {
    format!("https://gallica.bnf.fr/ark:/12148/{ark_id}")
}

/// Adapter for gallica.bnf.fr.
#[derive(Debug, Default)]
pub struct GallicaAdapter;

impl GallicaAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProviderAdapter for GallicaAdapter {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            key: "gallica",
            display_name: "BnF Gallica",
        }
    }

    #[instrument(skip(self, executor), fields(provider = "gallica"))]
    async fn search(
        &self,
        executor: &HttpExecutor,
        title: &str,
        creator: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<Candidate>, FetchError> {
        let mut query = format!("gallica all \"{}\"", escape_sru_literal(title));
        if let Some(creator) = creator {
            query.push_str(&format!(
                " and dc.creator all \"{}\"",
                escape_sru_literal(creator)
            ));
        }

        let mut url = url::Url::parse(SRU_URL).map_err(|_| FetchError::InvalidUrl {
            url: SRU_URL.to_string(),
        })?;
        url.query_pairs_mut()
            .append_pair("version", "1.2")
            .append_pair("operation", "searchRetrieve")
            .append_pair("query", &query)
            .append_pair("maximumRecords", &max_results.to_string())
            .append_pair("recordSchema", "oai_dc");

        info!(title, "searching Gallica");
        let xml = executor.get_text(self.info().key, url.as_str()).await?;
        let records = parse_sru_records(&xml)?;

        let mut candidates = Vec::new();
        for record in records.into_iter().take(max_results) {
            let Some(ark_id) = record.ark_id else {
                continue;
            };
            let mut candidate = Candidate::new(
                self.info().key,
                self.info().display_name,
                record.title.unwrap_or_else(|| "N/A".to_string()),
                ark_id.clone(),
            );
            if let Some(creator) = record.creator {
                candidate.creators = vec![creator];
            }
            candidate.date = record.date;
            candidate.item_url = Some(item_url(&ark_id));
            candidate.iiif_manifest_url = Some(manifest_url(&ark_id));
            candidate.download_hint = serde_json::json!({ "ark_id": ark_id });
            candidates.push(candidate);
        }
        debug!(count = candidates.len(), "Gallica search done");
        Ok(candidates)
    }

    #[instrument(skip_all, fields(provider = "gallica", source_id = %candidate.source_id))]
    async fn download(
        &self,
        executor: &HttpExecutor,
        candidate: &Candidate,
        ctx: &TaskContext,
        namer: &mut ArtifactNamer,
        options: &DownloadOptions,
    ) -> Result<DownloadOutcome, FetchError> {
        let ark_id = candidate
            .download_hint
            .get("ark_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(&candidate.source_id);
        let mut outcome = DownloadOutcome::default();

        let url = candidate
            .iiif_manifest_url
            .clone()
            .unwrap_or_else(|| manifest_url(ark_id));
        info!(url = %url, "fetching Gallica IIIF manifest");
        let manifest = executor.get_json(self.info().key, &url).await?;
        save_metadata_json(executor, ctx, namer, &manifest, options).await?;

        let rendered =
            download_renderings(executor, ctx, namer, &manifest, options, &mut outcome).await?;
        if rendered > 0 && options.prefer_pdf_over_images {
            info!(rendered, "got bundled renderings, skipping page images");
            return Ok(outcome);
        }

        let bases = iiif::extract_image_service_bases(&manifest);
        if bases.is_empty() {
            warn!(ark_id, "no image services in Gallica manifest");
        } else {
            download_page_images(executor, ctx, namer, &bases, options, &mut outcome).await?;
        }

        if !outcome.any_written() && outcome.skipped_reason.is_none() {
            outcome.skipped_reason = Some("no-downloadable-artifacts".to_string());
        }
        Ok(outcome)
    }
}
