// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Built-in recognition backends.
//
// `plain-text` and `pdf-text` are always available.  `ocrs` needs the `ocr`
// feature and the model files on disk; it is registered lazily, so a missing
// model only fails when the engine is applied.

use std::sync::Arc;

use lesewerk_core::AppConfig;
use lesewerk_core::error::Result;

use crate::engine::{EngineCatalog, RecognitionBackend};

pub mod document;
#[cfg(feature = "ocr")]
pub mod ocr;
pub mod plain_text;

pub use document::PdfTextBackend;
pub use plain_text::PlainTextBackend;

/// Catalog holding every backend compiled into this build.
pub fn builtin_catalog(config: &AppConfig) -> EngineCatalog {
    let mut catalog = EngineCatalog::new();
    catalog.register(
        plain_text::ENGINE_ID,
        Arc::new(|| -> Result<Arc<dyn RecognitionBackend>> {
            Ok(Arc::new(PlainTextBackend::new()))
        }),
    );
    catalog.register(
        document::ENGINE_ID,
        Arc::new(|| -> Result<Arc<dyn RecognitionBackend>> {
            Ok(Arc::new(PdfTextBackend::new()))
        }),
    );

    #[cfg(feature = "ocr")]
    {
        let model_config = match &config.ocr_model_dir {
            Some(dir) => ocr::OcrConfig::from_dir(dir),
            None => ocr::OcrConfig::default(),
        };
        catalog.register(
            ocr::ENGINE_ID,
            Arc::new(move || -> Result<Arc<dyn RecognitionBackend>> {
                Ok(Arc::new(ocr::OcrsBackend::new(model_config.clone())?))
            }),
        );
    }
    #[cfg(not(feature = "ocr"))]
    let _ = config;

    catalog
}
