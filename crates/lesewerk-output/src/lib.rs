// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// lesewerk-output: artifact writing for finished recognition jobs.
//
// Provides the ResultWriter (streamed text, table, and JSON-lines output plus
// paginated PDF reconstruction), the output naming template language, and the
// printpdf-based PDF assembly.

pub mod naming;
pub mod pdf;
mod sinks;
pub mod writer;

pub use naming::NameTemplate;
pub use pdf::PdfWriter;
pub use writer::{EntryKind, ResultWriter, WriterSetup, WriterStats};
