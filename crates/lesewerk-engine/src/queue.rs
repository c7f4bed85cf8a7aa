// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-mission task queue.
//
// Jobs are held in submission order behind one mutex.  Claiming, completing,
// cancelling and counting all happen under that lock, so each job is claimed
// by exactly one worker and the per-state counts always add up to the total.
//
// Nothing is persisted: losing the process discards unsaved batch content.

use std::sync::Mutex;

use chrono::Utc;
use tracing::{debug, info, instrument};

use lesewerk_core::error::{LesewerkError, Result};
use lesewerk_core::types::{
    FailedJob, Job, JobCounts, JobMetrics, JobResult, JobSpec, JobStatus,
};

/// What the caller should do with a completed job.
#[derive(Debug)]
pub enum Completion {
    /// Hand the finished job (with its full result) to the writer.
    Record(Box<Job>),
    /// The job was cancelled while in flight; drop the result.
    Discarded,
}

/// Outcome of `cancel_all`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CancelReport {
    /// Pending jobs flipped to `Cancelled`.
    pub pending: usize,
    /// Running jobs abandoned; their results will be discarded.
    pub running: usize,
}

#[derive(Debug, Default)]
struct QueueInner {
    jobs: Vec<Job>,
    /// Index of the first job that may still be `Pending`.
    cursor: usize,
    closed: bool,
    held: bool,
}

/// Ordered jobs of one mission.
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("task queue lock poisoned")
    }

    /// Append a pending job; returns its index.
    pub fn enqueue(&self, spec: JobSpec) -> Result<usize> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(LesewerkError::InvalidSubmission(
                "task queue is closed".into(),
            ));
        }
        let index = inner.jobs.len();
        inner.jobs.push(Job::from_spec(index, spec));
        debug!(job_index = index, "job enqueued");
        Ok(index)
    }

    /// Append many jobs atomically; returns the new jobs.
    pub fn enqueue_all(&self, specs: Vec<JobSpec>) -> Result<Vec<Job>> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(LesewerkError::InvalidSubmission(
                "task queue is closed".into(),
            ));
        }
        let first = inner.jobs.len();
        for (offset, spec) in specs.into_iter().enumerate() {
            inner.jobs.push(Job::from_spec(first + offset, spec));
        }
        Ok(inner.jobs[first..].to_vec())
    }

    /// Reject further arrivals.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    /// Stop handing out jobs until `release`.
    pub fn hold(&self) {
        self.lock().held = true;
    }

    pub fn release(&self) {
        self.lock().held = false;
    }

    /// Claim the earliest pending job, flipping it to `Running`.
    pub fn next_pending(&self) -> Option<Job> {
        let mut inner = self.lock();
        if inner.held {
            return None;
        }
        let start = inner.cursor;
        let offset = inner.jobs[start..]
            .iter()
            .position(|j| j.status == JobStatus::Pending)?;
        let index = start + offset;
        inner.cursor = index + 1;

        let job = &mut inner.jobs[index];
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        Some(job.clone())
    }

    /// Record the result of a claimed job.
    ///
    /// A job abandoned by `cancel_all` is left `Cancelled` and the result is
    /// discarded.  Completing a job that was never claimed is an invariant
    /// violation.
    #[instrument(skip(self, result, metrics))]
    pub fn complete(&self, index: usize, result: JobResult, metrics: JobMetrics) -> Result<Completion> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(index).ok_or_else(|| {
            LesewerkError::QueueInvariant(format!("completed unknown job {index}"))
        })?;

        match job.status {
            JobStatus::Running => {}
            JobStatus::Cancelled => {
                debug!(job_index = index, "late result for cancelled job discarded");
                return Ok(Completion::Discarded);
            }
            other => {
                return Err(LesewerkError::QueueInvariant(format!(
                    "job {index} completed while {other:?}"
                )));
            }
        }

        job.status = match result {
            JobResult::Failed { .. } => JobStatus::Failed,
            _ => JobStatus::Done,
        };
        job.finished_at = Some(Utc::now());
        job.metrics = Some(metrics);
        job.result = Some(result);

        let full = job.clone();
        if let Some(JobResult::Recognized { recognition }) = &mut job.result {
            recognition.raster = None;
        }
        Ok(Completion::Record(Box::new(full)))
    }

    /// Cancel every pending job and abandon every running one.
    pub fn cancel_all(&self) -> CancelReport {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut report = CancelReport::default();
        for job in inner.jobs.iter_mut() {
            match job.status {
                JobStatus::Pending => report.pending += 1,
                JobStatus::Running => report.running += 1,
                _ => continue,
            }
            job.status = JobStatus::Cancelled;
            job.finished_at = Some(now);
        }
        inner.cursor = inner.jobs.len();
        info!(pending = report.pending, running = report.running, "queue cancelled");
        report
    }

    pub fn counts(&self) -> JobCounts {
        let inner = self.lock();
        let mut counts = JobCounts::default();
        for job in &inner.jobs {
            counts.add(job.status);
        }
        counts
    }

    /// True once no job is pending or running.
    pub fn is_drained(&self) -> bool {
        self.lock().jobs.iter().all(|j| j.status.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failures(&self) -> Vec<FailedJob> {
        self.lock()
            .jobs
            .iter()
            .filter_map(|job| match &job.result {
                Some(JobResult::Failed { failure }) if job.status == JobStatus::Failed => {
                    Some(FailedJob {
                        index: job.index,
                        title: job.title(),
                        failure: failure.clone(),
                    })
                }
                _ => None,
            })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Job> {
        self.lock().jobs.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use lesewerk_core::error::JobFailure;
    use lesewerk_core::types::Recognition;

    fn queue_with(n: usize) -> TaskQueue {
        let queue = TaskQueue::new();
        for i in 0..n {
            queue.enqueue(JobSpec::image(format!("/in/{i}.png"))).unwrap();
        }
        queue
    }

    #[test]
    fn claims_follow_submission_order() {
        let queue = queue_with(3);
        let order: Vec<usize> = std::iter::from_fn(|| queue.next_pending().map(|j| j.index)).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(queue.next_pending().is_none());
    }

    #[test]
    fn concurrent_claims_are_exclusive() {
        let queue = Arc::new(queue_with(500));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let q = Arc::clone(&queue);
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(job) = q.next_pending() {
                        mine.push(job.index);
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for index in handle.join().unwrap() {
                assert!(seen.insert(index), "job {index} claimed twice");
            }
        }
        assert_eq!(seen.len(), 500);
        assert_eq!(queue.counts().running, 500);
    }

    #[test]
    fn held_queue_hands_out_nothing() {
        let queue = queue_with(2);
        let first = queue.next_pending().unwrap();
        queue.hold();
        assert!(queue.next_pending().is_none());
        let counts = queue.counts();
        assert_eq!((counts.running, counts.pending), (1, 1));

        // A claimed job can still finish while held.
        queue.complete(first.index, JobResult::Empty, JobMetrics::default()).unwrap();
        queue.release();
        assert_eq!(queue.next_pending().unwrap().index, 1);
    }

    #[test]
    fn cancel_all_discards_late_results() {
        let queue = queue_with(4);
        let running = queue.next_pending().unwrap();
        let report = queue.cancel_all();
        assert_eq!(report, CancelReport { pending: 3, running: 1 });

        let completion = queue
            .complete(running.index, JobResult::Empty, JobMetrics::default())
            .unwrap();
        assert!(matches!(completion, Completion::Discarded));
        let counts = queue.counts();
        assert_eq!(counts.cancelled, 4);
        assert_eq!(counts.total, 4);
        assert!(queue.is_drained());
    }

    #[test]
    fn completing_unclaimed_job_is_an_invariant_violation() {
        let queue = queue_with(1);
        let err = queue
            .complete(0, JobResult::Empty, JobMetrics::default())
            .unwrap_err();
        assert!(matches!(err, LesewerkError::QueueInvariant(_)));
        assert!(queue.complete(9, JobResult::Empty, JobMetrics::default()).is_err());
    }

    #[test]
    fn failures_are_listed_with_reason() {
        let queue = queue_with(2);
        let job = queue.next_pending().unwrap();
        queue
            .complete(
                job.index,
                JobResult::Failed {
                    failure: JobFailure::Timeout(10),
                },
                JobMetrics::default(),
            )
            .unwrap();
        let failures = queue.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].failure, JobFailure::Timeout(10));
        assert_eq!(queue.counts().failed, 1);
    }

    #[test]
    fn stored_result_drops_raster() {
        let queue = queue_with(1);
        let job = queue.next_pending().unwrap();
        let recognition = Recognition {
            raster: Some(vec![1, 2, 3]),
            ..Recognition::default()
        };
        let Completion::Record(full) = queue
            .complete(job.index, JobResult::Recognized { recognition }, JobMetrics::default())
            .unwrap()
        else {
            panic!("expected a record");
        };
        assert!(matches!(&full.result, Some(JobResult::Recognized { recognition }) if recognition.raster.is_some()));
        let stored = &queue.snapshot()[0];
        assert!(matches!(&stored.result, Some(JobResult::Recognized { recognition }) if recognition.raster.is_none()));
    }

    #[test]
    fn closed_queue_rejects_arrivals() {
        let queue = queue_with(0);
        queue.close();
        assert!(queue.enqueue(JobSpec::image("/in/late.png")).is_err());
    }
}
