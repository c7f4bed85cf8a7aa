// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// ResultWriter: turns finished jobs into artifacts for every configured format.
//
// Streamed formats are appended to as jobs finish.  Paginated formats buffer
// pages per document and assemble them in page order once the document's
// last page arrives; loose images form one mission-wide document written by
// `finish()`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Local};
use lesewerk_core::error::{JobFailure, LesewerkError, Result};
use lesewerk_core::{Job, JobResult, JobStatus, MissionConfig, OutputFormat, Recognition};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::naming::NameTemplate;
use crate::sinks::{ArtifactSink, IndividualTextSink, PaginatedSink, StreamSink};

/// Everything the writer needs to name and place artifacts.
#[derive(Debug, Clone)]
pub struct WriterSetup {
    /// `%name` for mission-wide artifacts.
    pub mission_name: String,
    pub output_dir: PathBuf,
    pub formats: Vec<OutputFormat>,
    pub template: NameTemplate,
    pub skip_blank: bool,
    /// Timestamp rendered into `%date`.
    pub started: DateTime<Local>,
}

impl WriterSetup {
    pub fn from_config(
        config: &MissionConfig,
        mission_name: impl Into<String>,
        output_dir: PathBuf,
        started: DateTime<Local>,
    ) -> Self {
        Self {
            mission_name: mission_name.into(),
            output_dir,
            formats: config.formats.clone(),
            template: NameTemplate::new(&config.name_template, &config.datetime_format),
            skip_blank: config.skip_blank,
            started,
        }
    }
}

/// How a recorded job showed up in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Recognised text was written.
    Text,
    /// An entry marked empty was written.
    Empty,
    /// An error entry was written.
    Error,
    /// Empty result omitted by skip-blank.
    Skipped,
    /// Nothing written: cancelled job or discarded writer.
    Dropped,
}

/// Per-kind entry counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    pub text: usize,
    pub empty: usize,
    pub errors: usize,
    pub skipped: usize,
}

impl WriterStats {
    /// Entries actually present in the output.
    pub fn entries(&self) -> usize {
        self.text + self.empty + self.errors
    }
}

/// One finished job as seen by the sinks.
pub(crate) struct Entry<'a> {
    pub job: &'a Job,
    pub kind: EntryKind,
    pub recognition: Option<&'a Recognition>,
    pub failure: Option<&'a JobFailure>,
}

impl Entry<'_> {
    pub fn text(&self) -> String {
        self.recognition.map(Recognition::text).unwrap_or_default()
    }
}

/// Writes one mission's results.
pub struct ResultWriter {
    setup: WriterSetup,
    sinks: Vec<Box<dyn ArtifactSink>>,
    stats: WriterStats,
    abort: Arc<AtomicBool>,
    closed: bool,
}

impl ResultWriter {
    /// Create the output directory and one sink per configured format.
    pub fn new(setup: WriterSetup) -> Result<Self> {
        std::fs::create_dir_all(&setup.output_dir).map_err(|e| {
            LesewerkError::Output(format!("create {}: {e}", setup.output_dir.display()))
        })?;

        let mut sinks: Vec<Box<dyn ArtifactSink>> = Vec::new();
        for format in &setup.formats {
            let sink: Box<dyn ArtifactSink> = match format {
                OutputFormat::TxtIndividual => Box::new(IndividualTextSink::default()),
                f if f.is_paginated() => Box::new(PaginatedSink::new(*f)),
                f => Box::new(StreamSink::new(*f)),
            };
            sinks.push(sink);
        }

        Ok(Self {
            setup,
            sinks,
            stats: WriterStats::default(),
            abort: Arc::new(AtomicBool::new(false)),
            closed: false,
        })
    }

    /// Flag that aborts an in-progress `finish()` from another thread.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Announce a job so paginated sinks know how many pages to wait for.
    pub fn register(&mut self, job: &Job) {
        for sink in &mut self.sinks {
            sink.expect(job);
        }
    }

    /// Route a terminal job to every sink.
    #[instrument(skip(self, job), fields(job_index = job.index))]
    pub fn record(&mut self, job: &Job) -> Result<EntryKind> {
        if self.closed || self.abort.load(Ordering::SeqCst) {
            return Ok(EntryKind::Dropped);
        }

        let (kind, recognition, failure) = match (&job.status, &job.result) {
            (JobStatus::Done, Some(JobResult::Recognized { recognition })) => {
                (EntryKind::Text, Some(recognition), None)
            }
            (JobStatus::Done, Some(JobResult::Empty)) if self.setup.skip_blank => {
                (EntryKind::Skipped, None, None)
            }
            (JobStatus::Done, Some(JobResult::Empty)) => (EntryKind::Empty, None, None),
            (JobStatus::Failed, Some(JobResult::Failed { failure })) => {
                (EntryKind::Error, None, Some(failure))
            }
            (status, _) => {
                debug!(?status, "job has no writable result");
                return Ok(EntryKind::Dropped);
            }
        };

        let entry = Entry {
            job,
            kind,
            recognition,
            failure,
        };
        for sink in &mut self.sinks {
            sink.write(&entry, &self.setup, &self.abort)?;
        }

        match kind {
            EntryKind::Text => self.stats.text += 1,
            EntryKind::Empty => self.stats.empty += 1,
            EntryKind::Error => self.stats.errors += 1,
            EntryKind::Skipped => self.stats.skipped += 1,
            EntryKind::Dropped => {}
        }
        Ok(kind)
    }

    /// Flush everything still buffered and close all artifacts.
    ///
    /// Returns every artifact path.  Fails without leaving partial paginated
    /// files behind when the abort flag is raised mid-flush.
    #[instrument(skip(self), fields(mission = %self.setup.mission_name))]
    pub fn finish(&mut self) -> Result<Vec<PathBuf>> {
        if self.closed {
            return Ok(self.artifacts());
        }
        for sink in &mut self.sinks {
            if let Err(e) = sink.finish(&self.setup, &self.abort) {
                self.discard();
                return Err(e);
            }
        }
        self.closed = true;
        let artifacts = self.artifacts();
        info!(artifacts = artifacts.len(), stats = ?self.stats, "Results written");
        Ok(artifacts)
    }

    /// Drop buffered pages and ignore every later record.
    pub fn discard(&mut self) {
        if self.closed {
            return;
        }
        self.abort.store(true, Ordering::SeqCst);
        self.closed = true;
        for sink in &mut self.sinks {
            sink.discard();
        }
        warn!(mission = %self.setup.mission_name, "Buffered output discarded");
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.sinks.iter().flat_map(|s| s.artifacts()).collect()
    }
}

pub(crate) fn aborted() -> LesewerkError {
    LesewerkError::Output("flush aborted by force-terminate".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lesewerk_core::{DocumentRef, InputKind, JobSpec, TextBlock};

    fn setup(dir: &std::path::Path, formats: Vec<OutputFormat>, skip_blank: bool) -> WriterSetup {
        WriterSetup {
            mission_name: "report".into(),
            output_dir: dir.to_path_buf(),
            formats,
            template: NameTemplate::new("[OCR]_%name_%date", "%Y%m%d_%H%M"),
            skip_blank,
            started: Local.with_ymd_and_hms(2023, 9, 1, 12, 13, 0).unwrap(),
        }
    }

    fn finished(index: usize, text: Option<&str>) -> Job {
        let mut job = Job::from_spec(index, JobSpec::image(format!("/scans/img{index}.png")));
        job.status = JobStatus::Done;
        job.result = Some(match text {
            Some(t) => JobResult::Recognized {
                recognition: Recognition::from_blocks(vec![TextBlock::new(t, 0.0, 0.0, 50.0, 10.0, 0.9)]),
            },
            None => JobResult::Empty,
        });
        job
    }

    fn five_jobs() -> Vec<Job> {
        vec![
            finished(0, Some("one")),
            finished(1, None),
            finished(2, Some("three")),
            finished(3, None),
            finished(4, Some("five")),
        ]
    }

    fn jsonl_lines(dir: &std::path::Path) -> Vec<serde_json::Value> {
        let text = std::fs::read_to_string(dir.join("[OCR]_report_20230901_1213.jsonl")).unwrap();
        text.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    }

    #[test]
    fn skip_blank_omits_empty_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ResultWriter::new(setup(dir.path(), vec![OutputFormat::Jsonl], true)).unwrap();
        for job in five_jobs() {
            writer.record(&job).unwrap();
        }
        writer.finish().unwrap();

        let stats = writer.stats();
        assert_eq!(stats.entries(), 3);
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.skipped, 2);
        assert_eq!(jsonl_lines(dir.path()).len(), 3);
    }

    #[test]
    fn without_skip_blank_empty_entries_are_marked() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ResultWriter::new(setup(dir.path(), vec![OutputFormat::Jsonl], false)).unwrap();
        for job in five_jobs() {
            writer.record(&job).unwrap();
        }
        writer.finish().unwrap();

        let lines = jsonl_lines(dir.path());
        assert_eq!(lines.len(), 5);
        let empty: Vec<_> = lines.iter().filter(|l| l["code"] == 101).collect();
        assert_eq!(empty.len(), 2);
        assert!(lines.iter().all(|l| l["error"].is_null()));
        assert_eq!(writer.stats().errors, 0);
    }

    #[test]
    fn txt_output_uses_template_name_and_headers() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ResultWriter::new(setup(dir.path(), vec![OutputFormat::Txt], false)).unwrap();
        writer.record(&finished(0, Some("hello"))).unwrap();
        let artifacts = writer.finish().unwrap();

        assert_eq!(artifacts, vec![dir.path().join("[OCR]_report_20230901_1213.txt")]);
        let text = std::fs::read_to_string(&artifacts[0]).unwrap();
        assert!(text.contains("≦ img0.png ≧"));
        assert!(text.contains("hello"));
    }

    #[test]
    fn existing_artifact_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let taken = dir.path().join("[OCR]_report_20230901_1213.txt");
        std::fs::write(&taken, "earlier run").unwrap();

        let mut writer = ResultWriter::new(setup(dir.path(), vec![OutputFormat::Txt], false)).unwrap();
        writer.record(&finished(0, Some("new"))).unwrap();
        let artifacts = writer.finish().unwrap();

        assert_eq!(std::fs::read_to_string(&taken).unwrap(), "earlier run");
        assert_eq!(artifacts, vec![dir.path().join("[OCR]_report_20230901_1213 (1).txt")]);
    }

    #[test]
    fn failed_jobs_produce_error_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ResultWriter::new(setup(dir.path(), vec![OutputFormat::Csv], false)).unwrap();
        let mut job = Job::from_spec(0, JobSpec::image("/scans/locked.pdf"));
        job.status = JobStatus::Failed;
        job.result = Some(JobResult::Failed {
            failure: JobFailure::DecryptionFailed,
        });
        assert_eq!(writer.record(&job).unwrap(), EntryKind::Error);
        let artifacts = writer.finish().unwrap();

        let csv = std::fs::read_to_string(&artifacts[0]).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("source,page,status,code,text,elapsed_ms,confidence"));
        assert!(lines.next().unwrap().contains("decryption_failed"));
    }

    #[test]
    fn cancelled_and_discarded_jobs_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ResultWriter::new(setup(dir.path(), vec![OutputFormat::Txt], false)).unwrap();
        let mut cancelled = Job::from_spec(0, JobSpec::image("/scans/a.png"));
        cancelled.status = JobStatus::Cancelled;
        assert_eq!(writer.record(&cancelled).unwrap(), EntryKind::Dropped);

        writer.discard();
        assert_eq!(writer.record(&finished(1, Some("late"))).unwrap(), EntryKind::Dropped);
        assert!(writer.artifacts().is_empty());
    }

    fn page_job(index: usize, page: u32, page_count: u32, text: &str) -> Job {
        let mut job = Job::from_spec(index, JobSpec::image("/docs/book.pdf"));
        job.kind = InputKind::Document;
        job.page = Some(page);
        job.document = Some(DocumentRef {
            key: "/docs/book.pdf".into(),
            name: "book".into(),
            page_count,
            range: None,
        });
        job.status = JobStatus::Done;
        job.result = Some(JobResult::Recognized {
            recognition: Recognition::from_blocks(vec![TextBlock::new(text, 5.0, 5.0, 60.0, 20.0, 1.0)]),
        });
        job
    }

    #[test]
    fn paginated_document_is_written_once_all_pages_arrive() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = setup(dir.path(), vec![OutputFormat::PdfText], false);
        s.template = NameTemplate::new("%name_%range", "%Y");
        let mut writer = ResultWriter::new(s).unwrap();

        let jobs = vec![page_job(0, 1, 2, "first"), page_job(1, 2, 2, "second")];
        for job in &jobs {
            writer.register(job);
        }
        // Completion order differs from page order.
        writer.record(&jobs[1]).unwrap();
        assert!(writer.artifacts().is_empty());
        writer.record(&jobs[0]).unwrap();

        let path = dir.path().join("book.text.pdf");
        assert_eq!(writer.artifacts(), vec![path.clone()]);
        assert!(std::fs::read(&path).unwrap().starts_with(b"%PDF"));
        assert!(!dir.path().join("book.text.pdf.part").exists());
    }

    #[test]
    fn aborted_flush_leaves_no_partial_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            ResultWriter::new(setup(dir.path(), vec![OutputFormat::PdfLayered], false)).unwrap();
        let job = finished(0, Some("pending page"));
        writer.register(&job);
        writer.record(&job).unwrap();

        writer.abort_handle().store(true, Ordering::SeqCst);
        assert!(writer.finish().is_err());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }
}
