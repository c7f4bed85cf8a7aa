// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// OCR backend built on the `ocrs` crate, a pure-Rust OCR engine backed by
// neural network models executed via `rten`.
//
// # Feature Gate
//
// Only compiled with the `ocr` feature:
//
// ```toml
// lesewerk-engine = { path = "crates/lesewerk-engine", features = ["ocr"] }
// ```
//
// # Model Setup
//
// The engine requires two model files:
//
// - **Detection model** (`text-detection.rten`) locates text regions.
// - **Recognition model** (`text-recognition.rten`) decodes characters.
//
// Running `ocrs-cli` once downloads both into `~/.cache/ocrs/`, which is the
// default model directory.  `AppConfig::ocr_model_dir` overrides it.
//
// **Important:** `ocrs` and `rten` must be compiled in release mode; debug
// builds are 10-100x slower.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use image::DynamicImage;
use ocrs::{ImageSource, OcrEngine, OcrEngineParams, TextItem};
use rten::Model;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use lesewerk_core::error::{JobFailure, LesewerkError, Result};
use lesewerk_core::{EngineCapabilities, InputKind, JobSource, Recognition, TextBlock};

use crate::engine::{RecognitionBackend, RecognitionRequest};

pub const ENGINE_ID: &str = "ocrs";

const DETECTION_MODEL_FILENAME: &str = "text-detection.rten";
const RECOGNITION_MODEL_FILENAME: &str = "text-recognition.rten";

/// `$XDG_CACHE_HOME/ocrs`, falling back to `~/.cache/ocrs`.
fn default_model_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(xdg).join("ocrs")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".cache").join("ocrs")
    } else {
        PathBuf::from("ocrs-models")
    }
}

/// Where the two model files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrConfig {
    pub detection_model_path: PathBuf,
    pub recognition_model_path: PathBuf,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self::from_dir(default_model_dir())
    }
}

impl OcrConfig {
    /// Expects `dir` to contain `text-detection.rten` and
    /// `text-recognition.rten`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            detection_model_path: dir.join(DETECTION_MODEL_FILENAME),
            recognition_model_path: dir.join(RECOGNITION_MODEL_FILENAME),
        }
    }

    /// Verify that both model files exist.
    pub fn validate(&self) -> Result<()> {
        for (what, path) in [
            ("detection", &self.detection_model_path),
            ("recognition", &self.recognition_model_path),
        ] {
            if !path.exists() {
                return Err(LesewerkError::BackendInit(format!(
                    "{what} model not found at {}; run `ocrs-cli` once to download models",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Image recognition through `ocrs`.
///
/// Model loading is the expensive step and happens once, when the engine is
/// applied.  Inference runs on the blocking pool.
pub struct OcrsBackend {
    engine: Arc<OcrEngine>,
}

impl OcrsBackend {
    #[instrument(skip_all, fields(
        detection = %config.detection_model_path.display(),
        recognition = %config.recognition_model_path.display(),
    ))]
    pub fn new(config: OcrConfig) -> Result<Self> {
        config.validate()?;

        info!("Loading OCR detection model");
        let detection_model = Model::load_file(&config.detection_model_path).map_err(|e| {
            LesewerkError::BackendInit(format!(
                "failed to load detection model from {}: {e}",
                config.detection_model_path.display()
            ))
        })?;

        info!("Loading OCR recognition model");
        let recognition_model = Model::load_file(&config.recognition_model_path).map_err(|e| {
            LesewerkError::BackendInit(format!(
                "failed to load recognition model from {}: {e}",
                config.recognition_model_path.display()
            ))
        })?;

        let engine = OcrEngine::new(OcrEngineParams {
            detection_model: Some(detection_model),
            recognition_model: Some(recognition_model),
            ..Default::default()
        })
        .map_err(|e| LesewerkError::BackendInit(format!("failed to initialise OCR engine: {e}")))?;

        info!("OCR engine initialised");
        Ok(Self {
            engine: Arc::new(engine),
        })
    }
}

fn decode(source: &JobSource) -> std::result::Result<DynamicImage, JobFailure> {
    let decoded = match source {
        JobSource::Path { path } => image::open(path),
        JobSource::Buffer { bytes, .. } => image::load_from_memory(bytes),
    };
    decoded.map_err(|e| JobFailure::UnsupportedInput(format!("{}: {e}", source.display_name())))
}

/// Detect words, group them into lines and recognise each line.
fn recognize_lines(engine: &OcrEngine, image: &DynamicImage) -> std::result::Result<Recognition, JobFailure> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();

    let source = ImageSource::from_bytes(rgb.as_raw(), (width, height))
        .map_err(|e| JobFailure::Backend(format!("image source ({width}x{height}): {e}")))?;
    let input = engine
        .prepare_input(source)
        .map_err(|e| JobFailure::Backend(format!("OCR preprocessing failed: {e}")))?;

    let word_rects = engine
        .detect_words(&input)
        .map_err(|e| JobFailure::Backend(format!("word detection failed: {e}")))?;
    let line_rects = engine.find_text_lines(&input, &word_rects);
    let lines = engine
        .recognize_text(&input, &line_rects)
        .map_err(|e| JobFailure::Backend(format!("line recognition failed: {e}")))?;
    debug!(words = word_rects.len(), lines = line_rects.len(), "OCR pass complete");

    // ocrs reports no per-line score.
    let blocks = lines
        .iter()
        .flatten()
        .filter_map(|line| {
            let text = line.to_string();
            if text.trim().is_empty() {
                return None;
            }
            let rect = line.bounding_rect();
            Some(TextBlock::new(
                text,
                rect.left() as f32,
                rect.top() as f32,
                rect.right() as f32,
                rect.bottom() as f32,
                1.0,
            ))
        })
        .collect();

    let mut recognition = Recognition::from_blocks(blocks);
    recognition.page_size = Some((width as f32, height as f32));
    Ok(recognition)
}

#[async_trait]
impl RecognitionBackend for OcrsBackend {
    fn id(&self) -> &str {
        ENGINE_ID
    }

    fn capabilities(&self) -> EngineCapabilities {
        // rten parallelises each inference internally.
        EngineCapabilities {
            supported_inputs: vec![InputKind::Image],
            max_concurrency: 1,
        }
    }

    async fn recognize(
        &self,
        request: RecognitionRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<Recognition, JobFailure> {
        if cancel.is_cancelled() {
            return Err(JobFailure::Backend("cancelled".into()));
        }
        let engine = Arc::clone(&self.engine);
        let source = request.source;
        let recognition = tokio::task::spawn_blocking(move || {
            let image = decode(&source)?;
            recognize_lines(&engine, &image)
        })
        .await
        .map_err(|e| JobFailure::Backend(format!("OCR task failed: {e}")))??;

        if cancel.is_cancelled() {
            return Err(JobFailure::Backend("cancelled".into()));
        }
        debug!(job_index = request.job_index, lines = recognition.blocks.len(), "image recognised");
        Ok(recognition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_dir() {
        let config = OcrConfig::from_dir("/tmp/my-models");
        assert_eq!(
            config.detection_model_path,
            PathBuf::from("/tmp/my-models/text-detection.rten")
        );
        assert_eq!(
            config.recognition_model_path,
            PathBuf::from("/tmp/my-models/text-recognition.rten")
        );
    }

    #[test]
    fn missing_models_fail_initialisation() {
        let result = OcrsBackend::new(OcrConfig::from_dir("/nonexistent/path/ocr-models"));
        assert!(matches!(result, Err(LesewerkError::BackendInit(_))));
    }

    #[test]
    fn undecodable_buffer_is_unsupported() {
        let source = JobSource::Buffer {
            name: "broken.png".into(),
            bytes: vec![0, 1, 2, 3],
        };
        assert!(matches!(decode(&source), Err(JobFailure::UnsupportedInput(_))));
    }
}
