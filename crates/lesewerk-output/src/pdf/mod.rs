// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// PDF module: layered and text-only document reconstruction.

pub mod writer;

pub use writer::{PageLayout, PdfWriter};
