// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Plain-language error messages.
//
// Every technical error is mapped to a short message with a suggestion.  The
// control API returns these as error bodies and the CLI prints them.

use serde::{Deserialize, Serialize};

use crate::error::{JobFailure, LesewerkError};

/// Severity of an error from the user's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Timeout or busy backend; trying again may work.
    Transient,
    /// The user has to do something first (stop a mission, fix a path).
    ActionRequired,
    /// Retrying will not help.
    Permanent,
}

/// A human-readable error with a message and an actionable suggestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanError {
    pub message: String,
    pub suggestion: String,
    pub retriable: bool,
    pub severity: Severity,
}

impl HumanError {
    fn new(message: impl Into<String>, suggestion: impl Into<String>, severity: Severity) -> Self {
        Self {
            message: message.into(),
            suggestion: suggestion.into(),
            retriable: severity == Severity::Transient,
            severity,
        }
    }
}

/// Convert a `LesewerkError` into a `HumanError`.
pub fn humanize_error(err: &LesewerkError) -> HumanError {
    match err {
        // -- Engine --
        LesewerkError::EngineBusy { active } => HumanError::new(
            "The recognition engine is in use.",
            format!("Stop the {active} running mission(s) first, then switch the engine."),
            Severity::ActionRequired,
        ),
        LesewerkError::UnknownEngine(id) => HumanError::new(
            "That recognition engine doesn't exist.",
            format!("Pick one of the engines listed by `lesewerk engine`. (Asked for: {id})"),
            Severity::Permanent,
        ),
        LesewerkError::BackendInit(detail) => HumanError::new(
            "The recognition engine could not be started.",
            format!("Check that its model files are installed. ({detail})"),
            Severity::Permanent,
        ),

        // -- Missions --
        LesewerkError::MissionNotFound(_) => HumanError::new(
            "No mission with that id.",
            "It may have been cleared. List missions to see what is still known.",
            Severity::Permanent,
        ),
        LesewerkError::InvalidTransition { .. } => HumanError::new(
            err.to_string(),
            "Check the mission's current state before sending this command.",
            Severity::ActionRequired,
        ),
        LesewerkError::ConfigFrozen => HumanError::new(
            "The mission's settings can no longer be changed.",
            "Submit a new mission with the settings you want.",
            Severity::ActionRequired,
        ),
        LesewerkError::MissionClosed(_) => HumanError::new(
            "The mission no longer accepts new files.",
            "Submit the files as a new mission.",
            Severity::ActionRequired,
        ),
        LesewerkError::InvalidSubmission(detail) | LesewerkError::InvalidPageRange(detail) => {
            HumanError::new(
                "The submission could not be accepted.",
                detail.clone(),
                Severity::ActionRequired,
            )
        }
        LesewerkError::QueueInvariant(_) => HumanError::new(
            "The mission stopped because of an internal error.",
            "Please report this. Other missions are not affected.",
            Severity::Permanent,
        ),

        // -- Output --
        LesewerkError::Output(detail) => HumanError::new(
            "The results could not be saved.",
            format!("Check that the output folder exists and is writable. ({detail})"),
            Severity::ActionRequired,
        ),
        LesewerkError::PdfError(_) => HumanError::new(
            "The PDF output could not be built.",
            "Try a text output format instead.",
            Severity::Permanent,
        ),
        LesewerkError::ImageError(_) => HumanError::new(
            "There's a problem with this image.",
            "The image may be damaged. Try saving it as PNG first.",
            Severity::Permanent,
        ),

        // -- Control API / config --
        LesewerkError::PortUnavailable(port) => HumanError::new(
            "No free port was found for the control API.",
            format!("Pick a different port than {port}, or close the program using it."),
            Severity::ActionRequired,
        ),
        LesewerkError::ControlApi(detail) => {
            let lower = detail.to_ascii_lowercase();
            if lower.contains("connection refused") {
                HumanError::new(
                    "No Lesewerk instance is listening.",
                    "Start one with `lesewerk serve`.",
                    Severity::ActionRequired,
                )
            } else if lower.contains("timed out") {
                HumanError::new(
                    "The Lesewerk instance didn't answer in time.",
                    "It may be busy. Try again.",
                    Severity::Transient,
                )
            } else {
                HumanError::new(
                    "The control request failed.",
                    detail.clone(),
                    Severity::Transient,
                )
            }
        }
        LesewerkError::ConfigPersistFailure(detail) => HumanError::new(
            "Settings could not be saved.",
            format!("Changes stay active until exit. ({detail})"),
            Severity::ActionRequired,
        ),

        LesewerkError::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::NotFound => HumanError::new(
                "The file couldn't be found.",
                "It may have been moved or deleted.",
                Severity::ActionRequired,
            ),
            std::io::ErrorKind::PermissionDenied => HumanError::new(
                "Permission denied.",
                "Check the file and folder permissions.",
                Severity::ActionRequired,
            ),
            _ => HumanError::new(
                "There was a problem reading or writing a file.",
                "Try again. If this keeps happening, the disk may be full.",
                Severity::Transient,
            ),
        },
        LesewerkError::Serialization(_) => HumanError::new(
            "The request or data was not valid JSON.",
            "Check the request body.",
            Severity::Permanent,
        ),
    }
}

/// Convert a per-job failure into a `HumanError`.
pub fn humanize_failure(failure: &JobFailure) -> HumanError {
    match failure {
        JobFailure::BackendUnavailable(_) => HumanError::new(
            "The recognition engine was not available.",
            "Check that the engine is installed, then run the file again.",
            Severity::Transient,
        ),
        JobFailure::Timeout(ms) => HumanError::new(
            "Recognition took too long.",
            format!("The limit is {ms} ms. Raise call_timeout_ms for large pages."),
            Severity::Transient,
        ),
        JobFailure::UnsupportedInput(detail) => HumanError::new(
            "The current engine can't read this kind of file.",
            format!("Switch to an engine that supports it. ({detail})"),
            Severity::Permanent,
        ),
        JobFailure::DecryptionFailed => HumanError::new(
            "The document is password protected.",
            "The password is missing or wrong. Add it to the mission's password table.",
            Severity::ActionRequired,
        ),
        JobFailure::Backend(detail) => HumanError::new(
            "Recognition failed on this file.",
            format!("The file may be damaged. ({detail})"),
            Severity::Permanent,
        ),
    }
}
