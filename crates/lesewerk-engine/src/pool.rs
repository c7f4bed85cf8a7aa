// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Worker pool: N tokio tasks per mission claiming jobs from the queue,
// dispatching them to the engine binding, and routing results to the writer.
//
// Per job the order is fixed: complete in the queue, record in the writer,
// drop the in-flight count, then report.  The supervisor therefore sees a
// drained queue with zero in flight only after every result is written.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use lesewerk_core::{Job, JobMetrics, JobResult, MissionConfig, MissionId};
use lesewerk_output::ResultWriter;

use crate::engine::{CallOutcome, CallSettings, EngineBinding, RecognitionRequest};
use crate::queue::{Completion, TaskQueue};

/// Reported by workers to the mission supervisor.
#[derive(Debug)]
pub enum PoolEvent {
    /// A claimed job reached a terminal state.
    JobFinished { index: usize },
    /// A worker found nothing to claim and parked.
    Idle,
    /// The queue or writer failed; the mission must stop.
    Fatal(String),
}

/// Everything a worker needs, shared by all workers of one mission.
pub struct PoolContext {
    pub mission_id: MissionId,
    pub queue: Arc<TaskQueue>,
    pub binding: Arc<EngineBinding>,
    pub writer: Arc<Mutex<ResultWriter>>,
    pub config: Arc<MissionConfig>,
    pub settings: CallSettings,
    pub events: mpsc::UnboundedSender<PoolEvent>,
}

struct Shared {
    ctx: PoolContext,
    wakeup: Notify,
    cancel: CancellationToken,
    in_flight: AtomicUsize,
}

/// Bounded set of workers for one mission.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks.  Must be called inside a tokio runtime.
    pub fn spawn(ctx: PoolContext, workers: usize) -> Self {
        let workers = workers.max(1);
        let shared = Arc::new(Shared {
            ctx,
            wakeup: Notify::new(),
            cancel: CancellationToken::new(),
            in_flight: AtomicUsize::new(0),
        });
        info!(mission_id = %shared.ctx.mission_id, workers, "Starting worker pool");
        let handles = (0..workers)
            .map(|worker| tokio::spawn(run_worker(Arc::clone(&shared), worker)))
            .collect();
        Self { shared, handles }
    }

    /// Wake parked workers after new arrivals or a resume.
    pub fn wake(&self) {
        self.shared.wakeup.notify_waiters();
    }

    /// Ask in-flight calls to stop and let every worker exit.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    /// Jobs claimed whose results are not yet recorded.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[instrument(skip(shared), fields(mission_id = %shared.ctx.mission_id))]
async fn run_worker(shared: Arc<Shared>, worker: usize) {
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }

        // Register for wakeups before looking, so an arrival between the
        // empty claim and the wait is not lost.
        let notified = shared.wakeup.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        match shared.ctx.queue.next_pending() {
            Some(job) => {
                let index = job.index;
                let event = process(&shared, job).await;
                shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                let _ = shared.ctx.events.send(event.unwrap_or(PoolEvent::JobFinished { index }));
            }
            None => {
                shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                let _ = shared.ctx.events.send(PoolEvent::Idle);
                tokio::select! {
                    _ = &mut notified => {}
                    _ = shared.cancel.cancelled() => break,
                }
            }
        }
    }
    debug!(worker, "worker exiting");
}

/// Run one claimed job to a terminal state.  Returns an event only on a
/// fatal error.
async fn process(shared: &Shared, job: Job) -> Option<PoolEvent> {
    let ctx = &shared.ctx;
    let index = job.index;
    let request = RecognitionRequest::for_job(&job, ctx.config.extraction_mode);
    let started = Instant::now();

    let outcome = ctx.binding.call(request, &shared.cancel, ctx.settings).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let (result, confidence) = match outcome {
        CallOutcome::Cancelled => {
            debug!(job_index = index, "call cancelled");
            (
                JobResult::Failed {
                    failure: lesewerk_core::JobFailure::Backend("cancelled".into()),
                },
                None,
            )
        }
        CallOutcome::Completed(Ok(mut recognition)) => {
            ctx.config.apply_ignore_regions(&mut recognition, &job);
            if recognition.is_empty() {
                (JobResult::Empty, None)
            } else {
                let confidence = recognition.confidence();
                (JobResult::Recognized { recognition }, confidence)
            }
        }
        CallOutcome::Completed(Err(failure)) => {
            warn!(job_index = index, error = %failure, "job failed");
            (JobResult::Failed { failure }, None)
        }
    };

    let metrics = JobMetrics {
        elapsed_ms,
        confidence,
    };
    let finished = match ctx.queue.complete(index, result, metrics) {
        Ok(Completion::Record(job)) => job,
        Ok(Completion::Discarded) => return None,
        Err(e) => {
            error!(job_index = index, error = %e, "queue rejected completion");
            return Some(PoolEvent::Fatal(e.to_string()));
        }
    };

    let writer = Arc::clone(&ctx.writer);
    let recorded = tokio::task::spawn_blocking(move || {
        writer
            .lock()
            .expect("result writer lock poisoned")
            .record(&finished)
    })
    .await;

    match recorded {
        Ok(Ok(kind)) => {
            debug!(job_index = index, ?kind, elapsed_ms, "job recorded");
            None
        }
        Ok(Err(e)) => {
            error!(job_index = index, error = %e, "writing result failed");
            Some(PoolEvent::Fatal(e.to_string()))
        }
        Err(e) => Some(PoolEvent::Fatal(format!("writer task failed: {e}"))),
    }
}
