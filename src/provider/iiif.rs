//! IIIF Presentation manifest helpers.
//!
//! Adapters only need two things from a manifest: the manifest-level
//! `rendering` entries (bundled PDF/EPUB alternates) and the Image API
//! service base per canvas. Both IIIF v2 (`sequences`/`canvases`) and v3
//! (`items` nesting) layouts are handled; everything else in the manifest
//! is ignored.

use serde_json::Value;

/// A manifest-level rendering: an alternate bundled format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendering {
    pub url: String,
    pub format: String,
}

impl Rendering {
    /// File extension implied by the rendering format or URL.
    #[must_use]
    pub fn extension(&self) -> &'static str {
        if self.format.contains("epub") || self.url.to_lowercase().ends_with(".epub") {
            "epub"
        } else {
            "pdf"
        }
    }
}

fn id_of(obj: &Value) -> Option<&str> {
    obj.get("@id").or_else(|| obj.get("id")).and_then(Value::as_str)
}

/// Extracts manifest-level renderings matching the MIME whitelist.
///
/// Entries without a format are still accepted when the URL ends in
/// `.pdf` or `.epub`. Duplicates are removed preserving order; at most
/// `limit` entries are returned.
#[must_use]
pub fn extract_renderings(manifest: &Value, whitelist: &[String], limit: usize) -> Vec<Rendering> {
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let entries: Vec<&Value> = match manifest.get("rendering") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(obj @ Value::Object(_)) => vec![obj],
        _ => Vec::new(),
    };

    for entry in entries {
        if out.len() >= limit {
            break;
        }
        let Some(url) = id_of(entry) else { continue };
        let format = entry
            .get("format")
            .or_else(|| entry.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase();

        let whitelisted = whitelist.is_empty()
            || whitelist.iter().any(|w| format.contains(&w.to_lowercase()));
        let url_lower = url.to_lowercase();
        let by_suffix = url_lower.ends_with(".pdf") || url_lower.ends_with(".epub");
        if !whitelisted && !by_suffix {
            continue;
        }
        if !seen.insert(url.to_string()) {
            continue;
        }
        out.push(Rendering {
            url: url.to_string(),
            format,
        });
    }
    out
}

/// Extracts Image API service base URLs from a v2 or v3 manifest,
/// deduplicated in canvas order.
#[must_use]
pub fn extract_image_service_bases(manifest: &Value) -> Vec<String> {
    let mut bases = Vec::new();

    // IIIF v2: sequences[0].canvases[].images[0].resource.service
    if let Some(canvases) = manifest
        .get("sequences")
        .and_then(|s| s.get(0))
        .and_then(|seq| seq.get("canvases"))
        .and_then(Value::as_array)
    {
        for canvas in canvases {
            let Some(resource) = canvas
                .get("images")
                .and_then(|i| i.get(0))
                .and_then(|img| img.get("resource"))
            else {
                continue;
            };
            let service_id = resource
                .get("service")
                .and_then(id_of)
                .map(str::to_string)
                .or_else(|| base_from_image_id(resource));
            if let Some(base) = service_id {
                bases.push(base);
            }
        }
    }

    // IIIF v3: items[].items[0].items[0].body.service[]
    if let Some(canvases) = manifest.get("items").and_then(Value::as_array) {
        for canvas in canvases {
            let Some(annotation) = canvas
                .get("items")
                .and_then(|p| p.get(0))
                .and_then(|page| page.get("items"))
                .and_then(|a| a.get(0))
            else {
                continue;
            };
            let body = match annotation.get("body") {
                Some(Value::Array(items)) if !items.is_empty() => &items[0],
                Some(body @ Value::Object(_)) => body,
                _ => continue,
            };
            let service = body.get("service").or_else(|| body.get("services"));
            let service_obj = match service {
                Some(Value::Array(items)) if !items.is_empty() => Some(&items[0]),
                Some(obj @ Value::Object(_)) => Some(obj),
                _ => None,
            };
            let base = service_obj
                .and_then(id_of)
                .map(str::to_string)
                .or_else(|| base_from_image_id(body));
            if let Some(base) = base {
                bases.push(base);
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    bases.retain(|b| seen.insert(b.clone()));
    bases
}

fn base_from_image_id(resource: &Value) -> Option<String> {
    let id = id_of(resource)?;
    id.split_once("/full/").map(|(base, _)| base.to_string())
}

/// Candidate full-size image URLs for an Image API service base.
///
/// Servers differ on the exact size/quality spelling; callers try these
/// in order until one works.
#[must_use]
pub fn image_url_candidates(service_base: &str) -> Vec<String> {
    let base = service_base.trim_end_matches('/');
    vec![
        format!("{base}/full/full/0/default.jpg"),
        format!("{base}/full/max/0/default.jpg"),
        format!("{base}/full/pct:100/0/default.jpg"),
        format!("{base}/full/full/0/native.jpg"),
    ]
}
