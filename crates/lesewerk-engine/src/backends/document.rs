// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// PDF text-layer backend: opens a document with `lopdf`, unlocks it with the
// job's password, and copies the embedded text of the requested page.
//
// Nothing is rendered, so the extraction modes that need recognition of page
// images are refused as unsupported input.

use async_trait::async_trait;
use lopdf::{Document, Object, ObjectId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use lesewerk_core::error::JobFailure;
use lesewerk_core::{EngineCapabilities, ExtractionMode, InputKind, JobSource, Recognition};

use crate::backends::plain_text::layout;
use crate::engine::{RecognitionBackend, RecognitionRequest};

pub const ENGINE_ID: &str = "pdf-text";

/// `Parent` hops followed when looking for an inherited `MediaBox`.
const MAX_PAGE_TREE_DEPTH: usize = 16;

#[derive(Debug, Default)]
pub struct PdfTextBackend;

impl PdfTextBackend {
    pub fn new() -> Self {
        Self
    }
}

/// Load `bytes` and decrypt them when the document is protected.
fn open(bytes: &[u8], password: Option<&str>) -> Result<Document, JobFailure> {
    let mut document = match Document::load_mem(bytes) {
        Ok(document) => document,
        Err(_) if contains(bytes, b"/Encrypt") => return Err(JobFailure::DecryptionFailed),
        Err(e) => return Err(JobFailure::UnsupportedInput(format!("unreadable PDF: {e}"))),
    };
    if document.is_encrypted() {
        let password = password.ok_or(JobFailure::DecryptionFailed)?;
        document
            .decrypt(password)
            .map_err(|_| JobFailure::DecryptionFailed)?;
        debug!("document unlocked");
    }
    Ok(document)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Width and height of a page in points, following inherited attributes.
fn media_box(document: &Document, page_id: ObjectId) -> Option<(f32, f32)> {
    let mut node = document.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_PAGE_TREE_DEPTH {
        if let Ok(bounds) = node.get_deref(b"MediaBox", document).and_then(Object::as_array) {
            let values: Vec<f32> = bounds.iter().filter_map(|v| v.as_float().ok()).collect();
            if let [x0, y0, x1, y1] = values[..] {
                return Some(((x1 - x0).abs(), (y1 - y0).abs()));
            }
            return None;
        }
        let parent = node.get(b"Parent").and_then(Object::as_reference).ok()?;
        node = document.get_dictionary(parent).ok()?;
    }
    None
}

/// Copy the text layer of one 1-based page.
fn extract_page(
    bytes: &[u8],
    page: u32,
    password: Option<&str>,
    mode: ExtractionMode,
) -> Result<Recognition, JobFailure> {
    if matches!(mode, ExtractionMode::FullPage | ExtractionMode::ImageOnly) {
        return Err(JobFailure::UnsupportedInput(format!(
            "{ENGINE_ID} copies text layers and cannot run {mode:?} extraction"
        )));
    }

    let document = open(bytes, password)?;
    let pages = document.get_pages();
    let page_id = *pages.get(&page).ok_or_else(|| {
        JobFailure::UnsupportedInput(format!(
            "page {page} out of range (document has {} pages)",
            pages.len()
        ))
    })?;

    let text = document
        .extract_text(&[page])
        .map_err(|e| JobFailure::Backend(format!("extract text of page {page}: {e}")))?;
    let mut recognition = layout(&text);
    if let Some(size) = media_box(&document, page_id) {
        recognition.page_size = Some(size);
    }
    Ok(recognition)
}

#[async_trait]
impl RecognitionBackend for PdfTextBackend {
    fn id(&self) -> &str {
        ENGINE_ID
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            supported_inputs: vec![InputKind::Document],
            max_concurrency: 8,
        }
    }

    #[instrument(skip_all, fields(job_index = request.job_index, page = ?request.page))]
    async fn recognize(
        &self,
        request: RecognitionRequest,
        cancel: CancellationToken,
    ) -> Result<Recognition, JobFailure> {
        let page = request.page.ok_or_else(|| {
            JobFailure::UnsupportedInput(format!("{} has no page number", request.source.display_name()))
        })?;
        let bytes = match &request.source {
            JobSource::Path { path } => {
                let read = tokio::fs::read(path);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(JobFailure::Backend("cancelled".into())),
                    read = read => read.map_err(|e| {
                        JobFailure::Backend(format!("read {}: {e}", path.display()))
                    })?,
                }
            }
            JobSource::Buffer { bytes, .. } => bytes.clone(),
        };

        let password = request.password;
        let mode = request.extraction;
        let task =
            tokio::task::spawn_blocking(move || extract_page(&bytes, page, password.as_deref(), mode));
        let recognition = tokio::select! {
            _ = cancel.cancelled() => return Err(JobFailure::Backend("cancelled".into())),
            joined = task => joined.map_err(|e| JobFailure::Backend(format!("extraction task failed: {e}")))??,
        };
        debug!(blocks = recognition.blocks.len(), "text layer copied");
        Ok(recognition)
    }
}
