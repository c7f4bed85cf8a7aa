// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Format adapters behind the ResultWriter.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use lesewerk_core::error::{LesewerkError, Result};
use lesewerk_core::{InputKind, Job, JobSource, OutputFormat, TextBlock};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::naming::{part_path, reserve_path, sanitize_file_stem};
use crate::pdf::{PageLayout, PdfWriter};
use crate::writer::{Entry, EntryKind, WriterSetup, aborted};

/// Group key for loose images and text files in paginated output.
const LOOSE_GROUP: &str = "";

const CSV_HEADER: &str = "source,page,status,code,text,elapsed_ms,confidence";

/// One output format.
pub(crate) trait ArtifactSink: Send {
    /// A job was enqueued; paginated sinks count expected pages.
    fn expect(&mut self, _job: &Job) {}

    fn write(&mut self, entry: &Entry<'_>, setup: &WriterSetup, abort: &AtomicBool) -> Result<()>;

    fn finish(&mut self, setup: &WriterSetup, abort: &AtomicBool) -> Result<()>;

    fn discard(&mut self);

    fn artifacts(&self) -> Vec<PathBuf>;
}

fn write_err(path: &Path, e: std::io::Error) -> LesewerkError {
    LesewerkError::Output(format!("write {}: {e}", path.display()))
}

// ---------------------------------------------------------------------------
// Streamed formats
// ---------------------------------------------------------------------------

/// Appends one entry per job to a single mission-wide file.
pub(crate) struct StreamSink {
    format: OutputFormat,
    path: Option<PathBuf>,
    out: Option<BufWriter<File>>,
}

impl StreamSink {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            path: None,
            out: None,
        }
    }

    /// Open the artifact on first use so skipped-only missions leave no file.
    fn open(&mut self, setup: &WriterSetup) -> Result<(&Path, &mut BufWriter<File>)> {
        if self.out.is_none() {
            let stem = setup.template.render(&setup.mission_name, None, &setup.started);
            let (path, file) = reserve_path(&setup.output_dir, &stem, self.format.extension())
                .map_err(|e| write_err(&setup.output_dir, e))?;
            let mut out = BufWriter::new(file);
            if self.format == OutputFormat::Csv {
                writeln!(out, "{CSV_HEADER}").map_err(|e| write_err(&path, e))?;
            }
            info!(path = %path.display(), format = ?self.format, "Opened output");
            self.path = Some(path);
            self.out = Some(out);
        }
        match (self.path.as_deref(), self.out.as_mut()) {
            (Some(path), Some(out)) => Ok((path, out)),
            _ => Err(LesewerkError::Output("output stream not open".into())),
        }
    }

    fn render(&self, entry: &Entry<'_>) -> Option<String> {
        let title = entry.job.title();
        let text = entry.text();
        match self.format {
            OutputFormat::Txt => Some(match entry.kind {
                EntryKind::Text => format!("≦ {title} ≧\n{text}\n\n"),
                EntryKind::Empty => format!("≦ {title} ≧\n[no text]\n\n"),
                EntryKind::Error => format!("≦ {title} ≧\n[error] {}\n\n", failure_text(entry)),
                _ => return None,
            }),
            OutputFormat::TxtPlain => match entry.kind {
                EntryKind::Text => Some(format!("{text}\n\n")),
                _ => None,
            },
            OutputFormat::Csv => {
                let metrics = entry.job.metrics.unwrap_or_default();
                let status = match entry.kind {
                    EntryKind::Text => "text",
                    EntryKind::Empty => "empty",
                    _ => entry.failure.map(|f| f.tag()).unwrap_or("error"),
                };
                let body = if entry.kind == EntryKind::Error { failure_text(entry) } else { text };
                Some(format!(
                    "{},{},{},{},{},{},{}\n",
                    csv_field(&entry.job.source.display_name()),
                    entry.job.page.map(|p| p.to_string()).unwrap_or_default(),
                    status,
                    code(entry),
                    csv_field(&body),
                    metrics.elapsed_ms,
                    metrics.confidence.map(|c| format!("{c:.3}")).unwrap_or_default(),
                ))
            }
            OutputFormat::Jsonl => {
                let metrics = entry.job.metrics.unwrap_or_default();
                let record = json!({
                    "index": entry.job.index,
                    "source": entry.job.source.display_name(),
                    "page": entry.job.page,
                    "code": code(entry),
                    "text": text,
                    "blocks": entry.recognition.map(|r| r.blocks.as_slice()).unwrap_or(&[]),
                    "error": entry.failure,
                    "elapsed_ms": metrics.elapsed_ms,
                    "confidence": metrics.confidence,
                });
                Some(format!("{record}\n"))
            }
            OutputFormat::Markdown => {
                let mut out = format!("## {title}\n\n");
                if entry.job.kind == InputKind::Image {
                    if let Some(path) = entry.job.source.path() {
                        out.push_str(&format!("![{title}](<{}>)\n\n", path.display()));
                    }
                }
                match entry.kind {
                    EntryKind::Text => out.push_str(&format!("{text}\n\n")),
                    EntryKind::Empty => out.push_str("*No text recognised.*\n\n"),
                    EntryKind::Error => out.push_str(&format!("> Error: {}\n\n", failure_text(entry))),
                    _ => return None,
                }
                Some(out)
            }
            _ => None,
        }
    }
}

impl ArtifactSink for StreamSink {
    fn write(&mut self, entry: &Entry<'_>, setup: &WriterSetup, _abort: &AtomicBool) -> Result<()> {
        if matches!(entry.kind, EntryKind::Skipped | EntryKind::Dropped) {
            return Ok(());
        }
        let Some(chunk) = self.render(entry) else {
            return Ok(());
        };
        let (path, out) = self.open(setup)?;
        out.write_all(chunk.as_bytes())
            .and_then(|_| out.flush())
            .map_err(|e| write_err(path, e))
    }

    fn finish(&mut self, _setup: &WriterSetup, _abort: &AtomicBool) -> Result<()> {
        if let (Some(path), Some(out)) = (self.path.as_deref(), self.out.as_mut()) {
            out.flush().map_err(|e| write_err(path, e))?;
        }
        self.out = None;
        Ok(())
    }

    fn discard(&mut self) {
        // Entries already streamed belong to finished jobs and stay on disk.
        if let Some(mut out) = self.out.take() {
            let _ = out.flush();
        }
    }

    fn artifacts(&self) -> Vec<PathBuf> {
        self.path.iter().cloned().collect()
    }
}

/// One `.txt` per job, named after its source.
#[derive(Default)]
pub(crate) struct IndividualTextSink {
    written: Vec<PathBuf>,
}

impl ArtifactSink for IndividualTextSink {
    fn write(&mut self, entry: &Entry<'_>, setup: &WriterSetup, _abort: &AtomicBool) -> Result<()> {
        if !matches!(entry.kind, EntryKind::Text | EntryKind::Empty) {
            return Ok(());
        }
        let stem = match entry.job.page {
            Some(page) => format!("{}_p{page}", entry.job.source.stem()),
            None => entry.job.source.stem(),
        };
        let (path, mut file) = reserve_path(&setup.output_dir, &sanitize_file_stem(&stem), "txt")
            .map_err(|e| write_err(&setup.output_dir, e))?;
        file.write_all(entry.text().as_bytes())
            .map_err(|e| write_err(&path, e))?;
        self.written.push(path);
        Ok(())
    }

    fn finish(&mut self, _setup: &WriterSetup, _abort: &AtomicBool) -> Result<()> {
        Ok(())
    }

    fn discard(&mut self) {}

    fn artifacts(&self) -> Vec<PathBuf> {
        self.written.clone()
    }
}

fn code(entry: &Entry<'_>) -> u16 {
    match entry.kind {
        EntryKind::Text => 100,
        EntryKind::Empty | EntryKind::Skipped => 101,
        EntryKind::Error | EntryKind::Dropped => 102,
    }
}

fn failure_text(entry: &Entry<'_>) -> String {
    entry.failure.map(|f| f.to_string()).unwrap_or_default()
}

fn csv_field(value: &str) -> String {
    if value.contains(&[',', '"', '\n', '\r'][..]) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// Paginated formats
// ---------------------------------------------------------------------------

/// Where a page's image comes from at assembly time.
enum Raster {
    None,
    Bytes(Vec<u8>),
    File(PathBuf),
}

struct PendingPage {
    index: usize,
    size: Option<(f32, f32)>,
    raster: Raster,
    blocks: Vec<TextBlock>,
}

#[derive(Default)]
struct PageGroup {
    name: String,
    range: Option<(u32, u32)>,
    expected: usize,
    received: usize,
    pages: Vec<PendingPage>,
}

/// Buffers pages per document and writes one PDF per document.
pub(crate) struct PaginatedSink {
    format: OutputFormat,
    groups: BTreeMap<String, PageGroup>,
    written: Vec<PathBuf>,
}

impl PaginatedSink {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            groups: BTreeMap::new(),
            written: Vec::new(),
        }
    }

    fn group_key(job: &Job) -> String {
        job.document
            .as_ref()
            .map(|d| d.key.clone())
            .unwrap_or_else(|| LOOSE_GROUP.to_string())
    }

    /// Group for `job`, named on first sight.  Groups created by `expect`
    /// get their name here.
    fn group_mut(&mut self, job: &Job, setup: &WriterSetup) -> &mut PageGroup {
        let group = self.groups.entry(Self::group_key(job)).or_default();
        if group.name.is_empty() {
            match &job.document {
                Some(doc) => {
                    group.name = doc.name.clone();
                    group.range = doc.range;
                }
                None => group.name = setup.mission_name.clone(),
            }
        }
        group
    }

    fn flush(&mut self, key: &str, setup: &WriterSetup, abort: &AtomicBool) -> Result<()> {
        let Some(mut group) = self.groups.remove(key) else {
            return Ok(());
        };
        if group.pages.is_empty() {
            debug!(document = %group.name, "no pages to assemble");
            return Ok(());
        }
        group.pages.sort_by_key(|p| p.index);

        let layouts: Vec<PageLayout> = group
            .pages
            .into_iter()
            .map(|page| PageLayout {
                size: page.size,
                raster: load_raster(page.raster),
                blocks: page.blocks,
            })
            .collect();

        let writer = PdfWriter::new(&group.name);
        let bytes = match self.format {
            OutputFormat::PdfLayered => writer.create_layered(&layouts)?,
            _ => writer.create_text_layout(&layouts)?,
        };
        if abort.load(Ordering::SeqCst) {
            return Err(aborted());
        }

        let stem = setup.template.render(&group.name, group.range, &setup.started);
        let (path, placeholder) = reserve_path(&setup.output_dir, &stem, self.format.extension())
            .map_err(|e| write_err(&setup.output_dir, e))?;
        drop(placeholder);
        let part = part_path(&path);

        let outcome = std::fs::write(&part, &bytes)
            .map_err(|e| write_err(&part, e))
            .and_then(|_| {
                if abort.load(Ordering::SeqCst) {
                    Err(aborted())
                } else {
                    std::fs::rename(&part, &path).map_err(|e| write_err(&path, e))
                }
            });
        if let Err(e) = outcome {
            let _ = std::fs::remove_file(&part);
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        info!(path = %path.display(), pages = layouts.len(), "Wrote paginated document");
        self.written.push(path);
        Ok(())
    }
}

impl ArtifactSink for PaginatedSink {
    fn expect(&mut self, job: &Job) {
        let key = Self::group_key(job);
        let group = self.groups.entry(key).or_default();
        group.expected += 1;
    }

    fn write(&mut self, entry: &Entry<'_>, setup: &WriterSetup, abort: &AtomicBool) -> Result<()> {
        let job = entry.job;
        let keep = match entry.kind {
            EntryKind::Text | EntryKind::Empty | EntryKind::Error => true,
            // The scan still belongs in the layered document, with no text layer.
            EntryKind::Skipped => self.format == OutputFormat::PdfLayered,
            EntryKind::Dropped => false,
        };
        let is_document = job.document.is_some();

        let group = self.group_mut(job, setup);
        group.received += 1;

        if keep {
            let recognition = entry.recognition;
            let raster = match recognition.and_then(|r| r.raster.clone()) {
                Some(bytes) => Raster::Bytes(bytes),
                None if job.kind == InputKind::Image => match &job.source {
                    JobSource::Path { path } => Raster::File(path.clone()),
                    JobSource::Buffer { bytes, .. } => Raster::Bytes(bytes.clone()),
                },
                None => Raster::None,
            };
            group.pages.push(PendingPage {
                index: job.index,
                size: recognition.and_then(|r| r.page_size),
                raster,
                blocks: recognition.map(|r| r.blocks.clone()).unwrap_or_default(),
            });
        }

        let complete = is_document && group.expected > 0 && group.received >= group.expected;
        if complete {
            self.flush(&Self::group_key(job), setup, abort)?;
        }
        Ok(())
    }

    fn finish(&mut self, setup: &WriterSetup, abort: &AtomicBool) -> Result<()> {
        let keys: Vec<String> = self.groups.keys().cloned().collect();
        for key in keys {
            if abort.load(Ordering::SeqCst) {
                return Err(aborted());
            }
            self.flush(&key, setup, abort)?;
        }
        Ok(())
    }

    fn discard(&mut self) {
        let pages: usize = self.groups.values().map(|g| g.pages.len()).sum();
        if pages > 0 {
            warn!(format = ?self.format, pages, "Dropping buffered pages");
        }
        self.groups.clear();
    }

    fn artifacts(&self) -> Vec<PathBuf> {
        self.written.clone()
    }
}

fn load_raster(raster: Raster) -> Option<Vec<u8>> {
    match raster {
        Raster::None => None,
        Raster::Bytes(bytes) => Some(bytes),
        Raster::File(path) => match std::fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "source image unreadable");
                None
            }
        },
    }
}
