// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Plain-text backend: copies the content of text inputs through as
// recognised blocks, one per non-blank line, laid out on a synthetic page.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use lesewerk_core::error::JobFailure;
use lesewerk_core::{EngineCapabilities, InputKind, JobSource, Recognition, TextBlock};

use crate::engine::{RecognitionBackend, RecognitionRequest};

pub const ENGINE_ID: &str = "plain-text";

/// Synthetic layout metrics, in points.
const LINE_HEIGHT: f32 = 16.0;
const LINE_PITCH: f32 = 20.0;
const CHAR_WIDTH: f32 = 8.0;
const MARGIN: f32 = 36.0;

#[derive(Debug, Default)]
pub struct PlainTextBackend;

impl PlainTextBackend {
    pub fn new() -> Self {
        Self
    }
}

/// Lay out `content` one block per non-blank line.
pub(crate) fn layout(content: &str) -> Recognition {
    let mut blocks = Vec::new();
    let mut widest: f32 = 0.0;
    for (row, line) in content.lines().enumerate() {
        let text = line.trim_end();
        if text.trim().is_empty() {
            continue;
        }
        let top = MARGIN + row as f32 * LINE_PITCH;
        let right = MARGIN + text.chars().count() as f32 * CHAR_WIDTH;
        widest = widest.max(right);
        blocks.push(TextBlock::new(text, MARGIN, top, right, top + LINE_HEIGHT, 1.0));
    }
    let rows = content.lines().count() as f32;
    let mut recognition = Recognition::from_blocks(blocks);
    recognition.page_size = Some((widest + MARGIN, MARGIN * 2.0 + rows * LINE_PITCH));
    recognition
}

#[async_trait]
impl RecognitionBackend for PlainTextBackend {
    fn id(&self) -> &str {
        ENGINE_ID
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            supported_inputs: vec![InputKind::Text],
            max_concurrency: 64,
        }
    }

    async fn recognize(
        &self,
        request: RecognitionRequest,
        cancel: CancellationToken,
    ) -> Result<Recognition, JobFailure> {
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

        let content = String::from_utf8(bytes).map_err(|_| {
            JobFailure::UnsupportedInput(format!("{} is not UTF-8 text", request.source.display_name()))
        })?;
        let recognition = layout(&content);
        debug!(job_index = request.job_index, blocks = recognition.blocks.len(), "text copied");
        Ok(recognition)
    }
}
