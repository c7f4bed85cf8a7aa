// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Lesewerk.
//
// Two families live here.  `LesewerkError` is returned synchronously to the
// caller of a mission or engine operation.  `JobFailure` is recorded on a
// single job and never aborts the mission that owns it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{MissionId, MissionState};

/// Top-level error type for all Lesewerk operations.
#[derive(Debug, Error)]
pub enum LesewerkError {
    // -- Engine binding --
    #[error("recognition engine is busy: {active} mission(s) still hold it")]
    EngineBusy { active: usize },

    #[error("unknown recognition engine: {0}")]
    UnknownEngine(String),

    #[error("recognition backend failed to initialise: {0}")]
    BackendInit(String),

    // -- Mission lifecycle --
    #[error("mission not found: {0}")]
    MissionNotFound(MissionId),

    #[error("cannot {event} a mission that is {from:?}")]
    InvalidTransition {
        from: MissionState,
        event: &'static str,
    },

    #[error("mission configuration is frozen once the mission has started")]
    ConfigFrozen,

    #[error("mission no longer accepts jobs (state {0:?})")]
    MissionClosed(MissionState),

    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("invalid page selection: {0}")]
    InvalidPageRange(String),

    /// Internal invariant violation inside a task queue.  Forces the owning
    /// mission to `Stopped`.
    #[error("task queue invariant violated: {0}")]
    QueueInvariant(String),

    // -- Output --
    #[error("output error: {0}")]
    Output(String),

    #[error("PDF operation failed: {0}")]
    PdfError(String),

    #[error("image processing failed: {0}")]
    ImageError(String),

    // -- Control API / configuration --
    #[error("no free port starting at {0}")]
    PortUnavailable(u16),

    #[error("control API error: {0}")]
    ControlApi(String),

    #[error("failed to persist configuration: {0}")]
    ConfigPersistFailure(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LesewerkError>;

/// Why a single job failed.
///
/// Failures are terminal: a failed job is reported, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JobFailure {
    #[error("recognition backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("recognition timed out after {0} ms")]
    Timeout(u64),

    #[error("unsupported input: {0}")]
    UnsupportedInput(String),

    #[error("document is encrypted and the password is missing or wrong")]
    DecryptionFailed,

    #[error("recognition failed: {0}")]
    Backend(String),
}

impl JobFailure {
    /// Short machine-readable tag, used in CSV and status output.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::Timeout(_) => "timeout",
            Self::UnsupportedInput(_) => "unsupported_input",
            Self::DecryptionFailed => "decryption_failed",
            Self::Backend(_) => "backend",
        }
    }
}
