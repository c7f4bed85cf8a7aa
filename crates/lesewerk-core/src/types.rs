// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Lesewerk batch recognition engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{JobFailure, LesewerkError};

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque mission identifier handed out at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MissionId(pub Uuid);

impl MissionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MissionId {
    type Err = LesewerkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| LesewerkError::InvalidSubmission(format!("bad mission id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Job sources
// ---------------------------------------------------------------------------

/// Where a job's input comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSource {
    /// A file on disk.
    Path { path: PathBuf },
    /// An in-memory buffer (pasted image, screenshot, API upload).
    Buffer { name: String, bytes: Vec<u8> },
}

impl JobSource {
    /// Display name: the file name for paths, the given name for buffers.
    pub fn display_name(&self) -> String {
        match self {
            Self::Path { path } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            Self::Buffer { name, .. } => name.clone(),
        }
    }

    /// File name without its extension.
    pub fn stem(&self) -> String {
        let name = self.display_name();
        match Path::new(&name).file_stem() {
            Some(stem) => stem.to_string_lossy().into_owned(),
            None => name,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Path { path } => Some(path),
            Self::Buffer { .. } => None,
        }
    }

    /// Key used for the mission password table.
    pub fn key(&self) -> String {
        match self {
            Self::Path { path } => path.display().to_string(),
            Self::Buffer { name, .. } => name.clone(),
        }
    }
}

/// Coarse input classification, matched against backend capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// Raster image (one page).
    Image,
    /// Paginated document (PDF, XPS, EPUB, ...); one job per page.
    Document,
    /// Plain text whose content is copied rather than recognised.
    Text,
}

impl InputKind {
    /// Infer input kind from a file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpe" | "jpeg" | "jfif" | "png" | "webp" | "bmp" | "tif" | "tiff" | "gif" => {
                Some(Self::Image)
            }
            "pdf" | "xps" | "epub" | "mobi" | "fb2" | "cbz" => Some(Self::Document),
            "txt" => Some(Self::Text),
            _ => None,
        }
    }

    /// Infer input kind from a path's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

/// How a backend should treat a document page that carries both images and
/// an embedded text layer.  Forwarded to the backend as a hint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Recognise images, copy existing text.
    #[default]
    Mixed,
    /// Render the whole page and recognise it.
    FullPage,
    /// Recognise embedded images only.
    ImageOnly,
    /// Copy existing text only.
    TextOnly,
}

// ---------------------------------------------------------------------------
// Page selection
// ---------------------------------------------------------------------------

/// A 1-based, inclusive page span.  Negative values count from the end
/// (`-1` is the last page).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSpan {
    pub start: i32,
    pub end: i32,
}

impl PageSpan {
    pub fn new(start: i32, end: i32) -> Self {
        Self { start, end }
    }

    /// Resolve against a concrete page count into an absolute 1-based span.
    pub fn resolve(&self, page_count: u32) -> Result<(u32, u32), LesewerkError> {
        let count = page_count as i64;
        let mut a = self.start as i64;
        let mut b = self.end as i64;
        if a < 0 {
            a += count + 1;
        }
        if b < 0 {
            b += count + 1;
        }
        if a < 1 {
            return Err(LesewerkError::InvalidPageRange(format!(
                "range {}..{} must start at page 1 or later",
                self.start, self.end
            )));
        }
        if b > count {
            return Err(LesewerkError::InvalidPageRange(format!(
                "range {}..{} ends past the last page ({page_count})",
                self.start, self.end
            )));
        }
        if a > b {
            return Err(LesewerkError::InvalidPageRange(format!(
                "range {}..{} is reversed",
                self.start, self.end
            )));
        }
        Ok((a as u32, b as u32))
    }

    /// Whether 1-based `page` falls inside the span for a document of
    /// `page_count` pages.  Unresolvable spans match nothing.
    pub fn contains(&self, page: u32, page_count: u32) -> bool {
        let count = page_count as i64;
        let start = if self.start < 0 { self.start as i64 + count + 1 } else { self.start as i64 };
        let end = if self.end < 0 { self.end as i64 + count + 1 } else { self.end as i64 };
        (start..=end).contains(&(page as i64))
    }
}

/// Reference from a page job back to the document it was cut from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    /// Stable grouping key (the document path).
    pub key: String,
    /// Display name without extension, used for `%name`.
    pub name: String,
    /// Total pages in the source document.
    pub page_count: u32,
    /// Selected pages as an absolute span, or `None` for the full document.
    pub range: Option<(u32, u32)>,
}

// ---------------------------------------------------------------------------
// Recognition payloads
// ---------------------------------------------------------------------------

/// One recognised text block with its quadrilateral in input coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    /// Corners clockwise from top-left, `[x, y]` in pixels.
    #[serde(rename = "box")]
    pub bbox: [[f32; 2]; 4],
    pub score: f32,
    /// Separator emitted after this block when joining text.
    #[serde(default = "default_block_end")]
    pub end: String,
}

fn default_block_end() -> String {
    "\n".into()
}

impl TextBlock {
    pub fn new(text: impl Into<String>, x0: f32, y0: f32, x1: f32, y1: f32, score: f32) -> Self {
        Self {
            text: text.into(),
            bbox: [[x0, y0], [x1, y0], [x1, y1], [x0, y1]],
            score,
            end: default_block_end(),
        }
    }

    /// Axis-aligned bounds `(x0, y0, x1, y1)`.
    pub fn bounds(&self) -> (f32, f32, f32, f32) {
        let xs = self.bbox.iter().map(|p| p[0]);
        let ys = self.bbox.iter().map(|p| p[1]);
        (
            xs.clone().fold(f32::INFINITY, f32::min),
            ys.clone().fold(f32::INFINITY, f32::min),
            xs.fold(f32::NEG_INFINITY, f32::max),
            ys.fold(f32::NEG_INFINITY, f32::max),
        )
    }
}

/// Recognised content of one job as returned by a backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    pub blocks: Vec<TextBlock>,
    /// Width and height of the recognised input in pixels, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<(f32, f32)>,
    /// Rendered page image (PNG/JPEG) supplied by the backend for document
    /// pages.  Only the layered PDF output uses it; it is never retained.
    #[serde(skip)]
    pub raster: Option<Vec<u8>>,
}

impl Recognition {
    pub fn from_blocks(blocks: Vec<TextBlock>) -> Self {
        Self {
            blocks,
            ..Self::default()
        }
    }

    /// Join all blocks using their separators.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            out.push_str(&block.text);
            out.push_str(&block.end);
        }
        out.trim_end().to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|b| b.text.trim().is_empty())
    }

    /// Mean block score, or `None` without blocks.
    pub fn confidence(&self) -> Option<f32> {
        if self.blocks.is_empty() {
            return None;
        }
        let sum: f32 = self.blocks.iter().map(|b| b.score).sum();
        Some(sum / self.blocks.len() as f32)
    }
}

/// Rectangular area whose contained text is dropped from the output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IgnoreRegion {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl IgnoreRegion {
    /// True when the block lies entirely inside this region.
    pub fn covers(&self, block: &TextBlock) -> bool {
        let (bx0, by0, bx1, by1) = block.bounds();
        bx0 >= self.x0 && by0 >= self.y0 && bx1 <= self.x1 && by1 <= self.y1
    }
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobResult {
    Recognized { recognition: Recognition },
    /// Recognition succeeded but found no text.
    Empty,
    Failed { failure: JobFailure },
}

impl JobResult {
    /// Numeric result code: 100 text, 101 no text, 102 error.
    pub fn code(&self) -> u16 {
        match self {
            Self::Recognized { .. } => 100,
            Self::Empty => 101,
            Self::Failed { .. } => 102,
        }
    }
}

/// Timing and quality information for a finished job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub elapsed_ms: u64,
    pub confidence: Option<f32>,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Lifecycle states of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed.
    Pending,
    /// Claimed by a worker; backend call in flight.
    Running,
    /// Finished with text or with an empty result.
    Done,
    /// Finished with a recorded failure.
    Failed,
    /// Abandoned by a force-terminate.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// What a submission asks the queue to run.  The queue turns it into a
/// [`Job`] by assigning identity and order.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub source: JobSource,
    pub kind: InputKind,
    pub page: Option<u32>,
    pub document: Option<DocumentRef>,
    pub password: Option<String>,
}

impl JobSpec {
    pub fn image(path: impl Into<PathBuf>) -> Self {
        Self {
            source: JobSource::Path { path: path.into() },
            kind: InputKind::Image,
            page: None,
            document: None,
            password: None,
        }
    }

    pub fn buffer(name: impl Into<String>, bytes: Vec<u8>, kind: InputKind) -> Self {
        Self {
            source: JobSource::Buffer {
                name: name.into(),
                bytes,
            },
            kind,
            page: None,
            document: None,
            password: None,
        }
    }
}

/// One unit of recognition work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Position in submission order; the claim order.
    pub index: usize,
    pub source: JobSource,
    pub kind: InputKind,
    /// 1-based page number for document jobs.
    pub page: Option<u32>,
    pub document: Option<DocumentRef>,
    #[serde(skip)]
    pub password: Option<String>,
    pub status: JobStatus,
    pub result: Option<JobResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub metrics: Option<JobMetrics>,
}

impl Job {
    pub fn from_spec(index: usize, spec: JobSpec) -> Self {
        Self {
            id: JobId::new(),
            index,
            source: spec.source,
            kind: spec.kind,
            page: spec.page,
            document: spec.document,
            password: spec.password,
            status: JobStatus::Pending,
            result: None,
            started_at: None,
            finished_at: None,
            metrics: None,
        }
    }

    /// Human title used in output headers: `scan.png` or `report.pdf - P3`.
    pub fn title(&self) -> String {
        match self.page {
            Some(page) => format!("{} - P{page}", self.source.display_name()),
            None => self.source.display_name(),
        }
    }
}

// ---------------------------------------------------------------------------
// Missions
// ---------------------------------------------------------------------------

/// Mission lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MissionState {
    Idle,
    Running,
    Paused,
    Saving,
    Stopped,
    Completed,
}

impl MissionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed)
    }
}

/// Output artifact formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Text with a header per image or page.
    Txt,
    /// Recognised text only.
    TxtPlain,
    /// One `.txt` per job, named after its source.
    TxtIndividual,
    /// Delimited table.
    Csv,
    /// One JSON object per job.
    Jsonl,
    /// Markdown with image links and text.
    Markdown,
    /// Original imagery with an invisible, searchable text layer.
    PdfLayered,
    /// Blank pages carrying only the recognised text.
    PdfText,
}

impl OutputFormat {
    /// File extension appended to the computed artifact name.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Txt | Self::TxtIndividual => "txt",
            Self::TxtPlain => "p.txt",
            Self::Csv => "csv",
            Self::Jsonl => "jsonl",
            Self::Markdown => "md",
            Self::PdfLayered => "layered.pdf",
            Self::PdfText => "text.pdf",
        }
    }

    /// Paginated formats are assembled per document instead of streamed.
    pub fn is_paginated(&self) -> bool {
        matches!(self, Self::PdfLayered | Self::PdfText)
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "txt" => Some(Self::Txt),
            "p.txt" | "txt_plain" | "plain" => Some(Self::TxtPlain),
            "txt_individual" | "individual" => Some(Self::TxtIndividual),
            "csv" => Some(Self::Csv),
            "jsonl" => Some(Self::Jsonl),
            "md" | "markdown" => Some(Self::Markdown),
            "layered.pdf" | "pdf_layered" | "layered" => Some(Self::PdfLayered),
            "text.pdf" | "pdf_text" => Some(Self::PdfText),
            _ => None,
        }
    }
}

/// Mission configuration.  Frozen once the mission leaves `Idle`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MissionConfig {
    pub formats: Vec<OutputFormat>,
    /// Artifact directory; defaults to the directory of the first source.
    pub output_dir: Option<PathBuf>,
    /// Artifact name template (`%name`, `%date`, `%range`).
    pub name_template: String,
    /// Sub-template for `%date` (`%Y %m %d %H %M %S %unix`).
    pub datetime_format: String,
    pub ignore_regions: Vec<IgnoreRegion>,
    /// Pages the ignore regions apply to; all pages when `None`.
    pub ignore_pages: Option<PageSpan>,
    /// Walk sub-directories when importing a directory.
    pub recursive_import: bool,
    /// Omit entries for jobs with no recognised text.
    pub skip_blank: bool,
    pub extraction_mode: ExtractionMode,
    /// Passwords for protected documents, keyed by source path.
    #[serde(skip_serializing)]
    pub passwords: HashMap<String, String>,
    /// Worker count for this mission; capped by the engine ceiling.
    pub concurrency: Option<usize>,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            formats: vec![OutputFormat::Txt],
            output_dir: None,
            name_template: "[OCR]_%name_%date".into(),
            datetime_format: "%Y%m%d_%H%M".into(),
            ignore_regions: Vec::new(),
            ignore_pages: None,
            recursive_import: false,
            skip_blank: false,
            extraction_mode: ExtractionMode::Mixed,
            passwords: HashMap::new(),
            concurrency: None,
        }
    }
}

impl MissionConfig {
    /// Drop blocks covered by an ignore region, honouring `ignore_pages`.
    ///
    /// Image jobs (no page) are always subject to the regions.
    pub fn apply_ignore_regions(&self, recognition: &mut Recognition, job: &Job) {
        if self.ignore_regions.is_empty() {
            return;
        }
        if let (Some(span), Some(page), Some(doc)) = (self.ignore_pages, job.page, &job.document) {
            if !span.contains(page, doc.page_count) {
                return;
            }
        }
        recognition
            .blocks
            .retain(|block| !self.ignore_regions.iter().any(|r| r.covers(block)));
    }
}

/// Per-state job counts.  `total` always equals the sum of the others.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

impl JobCounts {
    pub fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Done => self.done += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
        self.total += 1;
    }

    pub fn terminal(&self) -> usize {
        self.done + self.failed + self.cancelled
    }
}

/// One failed job as listed in a status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    pub index: usize,
    pub title: String,
    pub failure: JobFailure,
}

/// Why a mission ended in `Stopped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    Terminated,
    Fatal(String),
}

/// Cheap status snapshot of one mission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionStatus {
    pub id: MissionId,
    pub name: String,
    pub state: MissionState,
    pub counts: JobCounts,
    pub elapsed_ms: u64,
    pub engine: Option<String>,
    pub interruptible: bool,
    #[serde(default)]
    pub failures: Vec<FailedJob>,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

// ---------------------------------------------------------------------------
// Engine descriptors
// ---------------------------------------------------------------------------

/// What a recognition backend declares about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCapabilities {
    pub supported_inputs: Vec<InputKind>,
    /// Maximum number of simultaneous calls the backend tolerates.
    pub max_concurrency: usize,
}

impl EngineCapabilities {
    pub fn supports(&self, kind: InputKind) -> bool {
        self.supported_inputs.contains(&kind)
    }
}

/// Identifier plus capabilities of a recognition backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineDescriptor {
    pub id: String,
    pub capabilities: EngineCapabilities,
}

/// Standard paper sizes, used when a page has no known geometry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaperSize {
    #[default]
    A4,
    A5,
    Letter,
    Legal,
    Custom { width_mm: u32, height_mm: u32 },
}

impl PaperSize {
    /// Dimensions in millimetres (width, height).
    pub fn dimensions_mm(&self) -> (u32, u32) {
        match self {
            Self::A4 => (210, 297),
            Self::A5 => (148, 210),
            Self::Letter => (216, 279),
            Self::Legal => (216, 356),
            Self::Custom {
                width_mm,
                height_mm,
            } => (*width_mm, *height_mm),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_span_resolves_negative_indices_from_the_end() {
        assert_eq!(PageSpan::new(1, -1).resolve(10).unwrap(), (1, 10));
        assert_eq!(PageSpan::new(-3, -1).resolve(10).unwrap(), (8, 10));
        assert_eq!(PageSpan::new(2, 4).resolve(10).unwrap(), (2, 4));
    }

    #[test]
    fn page_span_rejects_out_of_bounds() {
        assert!(PageSpan::new(0, 3).resolve(10).is_err());
        assert!(PageSpan::new(1, 11).resolve(10).is_err());
        assert!(PageSpan::new(5, 2).resolve(10).is_err());
        assert!(PageSpan::new(-11, 2).resolve(10).is_err());
    }

    #[test]
    fn page_span_contains_counts_negatives_from_the_end() {
        let span = PageSpan::new(2, -2);
        assert!(!span.contains(1, 5));
        assert!(span.contains(2, 5));
        assert!(span.contains(4, 5));
        assert!(!span.contains(5, 5));
    }

    #[test]
    fn recognition_joins_blocks_with_separators() {
        let mut first = TextBlock::new("Hello", 0.0, 0.0, 10.0, 10.0, 0.9);
        first.end = " ".into();
        let second = TextBlock::new("world", 12.0, 0.0, 30.0, 10.0, 0.7);
        let rec = Recognition::from_blocks(vec![first, second]);
        assert_eq!(rec.text(), "Hello world");
        let confidence = rec.confidence().unwrap();
        assert!((confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn ignore_regions_drop_only_covered_blocks() {
        let config = MissionConfig {
            ignore_regions: vec![IgnoreRegion {
                x0: 0.0,
                y0: 0.0,
                x1: 100.0,
                y1: 20.0,
            }],
            ..MissionConfig::default()
        };
        let job = Job::from_spec(0, JobSpec::image("/tmp/a.png"));
        let mut rec = Recognition::from_blocks(vec![
            TextBlock::new("header", 5.0, 5.0, 90.0, 15.0, 1.0),
            TextBlock::new("body", 5.0, 30.0, 90.0, 45.0, 1.0),
        ]);
        config.apply_ignore_regions(&mut rec, &job);
        assert_eq!(rec.blocks.len(), 1);
        assert_eq!(rec.blocks[0].text, "body");
    }

    #[test]
    fn ignore_regions_respect_page_span() {
        let config = MissionConfig {
            ignore_regions: vec![IgnoreRegion {
                x0: 0.0,
                y0: 0.0,
                x1: 100.0,
                y1: 100.0,
            }],
            ignore_pages: Some(PageSpan::new(1, 1)),
            ..MissionConfig::default()
        };
        let mut job = Job::from_spec(0, JobSpec::image("/tmp/doc.pdf"));
        job.kind = InputKind::Document;
        job.page = Some(2);
        job.document = Some(DocumentRef {
            key: "/tmp/doc.pdf".into(),
            name: "doc".into(),
            page_count: 3,
            range: None,
        });
        let mut rec = Recognition::from_blocks(vec![TextBlock::new("kept", 1.0, 1.0, 5.0, 5.0, 1.0)]);
        config.apply_ignore_regions(&mut rec, &job);
        assert_eq!(rec.blocks.len(), 1);
    }

    #[test]
    fn input_kind_from_extension() {
        assert_eq!(InputKind::from_extension("PNG"), Some(InputKind::Image));
        assert_eq!(InputKind::from_extension("pdf"), Some(InputKind::Document));
        assert_eq!(InputKind::from_extension("txt"), Some(InputKind::Text));
        assert_eq!(InputKind::from_extension("docx"), None);
    }

    #[test]
    fn job_counts_total_tracks_every_add() {
        let mut counts = JobCounts::default();
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Done,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            counts.add(status);
        }
        assert_eq!(counts.total, 5);
        assert_eq!(counts.terminal(), 3);
    }

    #[test]
    fn mission_id_parses_from_string() {
        let id = MissionId::new();
        let parsed: MissionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<MissionId>().is_err());
    }

    #[test]
    fn output_format_extensions() {
        assert_eq!(OutputFormat::TxtPlain.extension(), "p.txt");
        assert_eq!(OutputFormat::PdfLayered.extension(), "layered.pdf");
        assert_eq!(OutputFormat::parse("jsonl"), Some(OutputFormat::Jsonl));
        assert!(OutputFormat::PdfText.is_paginated());
    }
}
