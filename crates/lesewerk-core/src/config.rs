// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Application configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::MissionConfig;

/// Default port for the local control API.
pub const DEFAULT_CONTROL_PORT: u16 = 1224;

/// Persistent application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Whether `serve` starts the control API.
    pub http_enabled: bool,
    /// Port for the control API (default 1224).  Rewritten with the
    /// effective port when the requested one was taken.
    pub control_port: u16,
    /// Bind all interfaces instead of loopback.  Firewalling is up to the user.
    pub allow_lan: bool,
    /// Combined ceiling on in-flight backend calls across all missions.
    /// `None` uses the host's available parallelism.
    pub max_concurrency: Option<usize>,
    /// Per-call recognition timeout.
    pub call_timeout_ms: u64,
    /// How long a cancelled call may run before its result is discarded.
    pub cancel_grace_ms: u64,
    /// Backend bound at startup.
    pub default_engine: String,
    /// Directory holding the OCR model files.  `None` uses the ocrs cache.
    pub ocr_model_dir: Option<PathBuf>,
    /// Defaults applied to missions submitted without a configuration.
    pub mission_defaults: MissionConfig,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_filter: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http_enabled: true,
            control_port: DEFAULT_CONTROL_PORT,
            allow_lan: false,
            max_concurrency: None,
            call_timeout_ms: 60_000,
            cancel_grace_ms: 3_000,
            default_engine: "plain-text".into(),
            ocr_model_dir: None,
            mission_defaults: MissionConfig::default(),
            log_filter: None,
        }
    }
}

impl AppConfig {
    /// Resolved concurrency ceiling before the backend's own limit is applied.
    pub fn concurrency_ceiling(&self) -> usize {
        self.max_concurrency
            .filter(|n| *n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
    }
}
