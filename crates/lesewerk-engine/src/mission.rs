// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Mission controller: the lifecycle state machine of one batch.
//
//   Idle --start--> Running <--pause/resume--> Paused
//   Running/Paused --all jobs terminal--> Saving --flush--> Completed
//   Running/Paused/Saving --force_terminate or fatal error--> Stopped
//
// Each state is one `Phase` record holding exactly the resources that state
// owns: an active run owns the engine lease, worker pool and writer; `Saving`
// owns the lease and the flush abort flag; terminal states own only the
// summary.  Leaving a state drops its resources.
//
// Lock order: phase, then writer, then queue.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use lesewerk_core::error::{LesewerkError, Result};
use lesewerk_core::{
    FailedJob, JobSource, JobSpec, MissionConfig, MissionId, MissionState, MissionStatus,
    StopReason,
};
use lesewerk_output::{ResultWriter, WriterSetup};

use crate::engine::{CallSettings, EngineLease, EngineSlot};
use crate::pool::{PoolContext, PoolEvent, WorkerPool};
use crate::queue::TaskQueue;

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Resources of a mission whose workers are alive.
struct Active {
    started_at: Instant,
    lease: EngineLease,
    pool: WorkerPool,
    writer: Arc<Mutex<ResultWriter>>,
    abort: Arc<AtomicBool>,
}

struct Flushing {
    started_at: Instant,
    lease: EngineLease,
    abort: Arc<AtomicBool>,
}

/// Summary kept once a mission is terminal.
struct Ended {
    elapsed: Duration,
    engine: String,
    artifacts: Vec<PathBuf>,
    reason: Option<StopReason>,
}

enum Phase {
    Idle,
    Running(Active),
    Paused(Active),
    Saving(Flushing),
    Stopped(Ended),
    Completed(Ended),
}

impl Phase {
    fn state(&self) -> MissionState {
        match self {
            Self::Idle => MissionState::Idle,
            Self::Running(_) => MissionState::Running,
            Self::Paused(_) => MissionState::Paused,
            Self::Saving(_) => MissionState::Saving,
            Self::Stopped(_) => MissionState::Stopped,
            Self::Completed(_) => MissionState::Completed,
        }
    }

    fn active(&self) -> Option<&Active> {
        match self {
            Self::Running(active) | Self::Paused(active) => Some(active),
            _ => None,
        }
    }
}

/// What the supervisor found when it looked at the mission.
enum Settle {
    /// Jobs are still pending or in flight.
    Busy,
    /// Everything is terminal; flush this writer.
    Flush(Arc<Mutex<ResultWriter>>),
    /// The mission already left its active run.
    Gone,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// One named batch of jobs with frozen output configuration.
pub struct MissionController {
    id: MissionId,
    name: String,
    config: Mutex<MissionConfig>,
    queue: Arc<TaskQueue>,
    phase: Mutex<Phase>,
    slot: Arc<EngineSlot>,
    settings: CallSettings,
    fallback_dir: PathBuf,
}

impl MissionController {
    pub fn new(
        name: impl Into<String>,
        config: MissionConfig,
        slot: Arc<EngineSlot>,
        settings: CallSettings,
        fallback_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: MissionId::new(),
            name: name.into(),
            config: Mutex::new(config),
            queue: Arc::new(TaskQueue::new()),
            phase: Mutex::new(Phase::Idle),
            slot,
            settings,
            fallback_dir,
        })
    }

    pub fn id(&self) -> MissionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().expect("mission phase lock poisoned")
    }

    pub fn state(&self) -> MissionState {
        self.phase().state()
    }

    /// True while closing the host process would lose work.
    pub fn is_interruptible(&self) -> bool {
        matches!(self.state(), MissionState::Running | MissionState::Paused)
    }

    /// Replace the configuration.  Only legal before `start`.
    pub fn configure(&self, config: MissionConfig) -> Result<()> {
        let phase = self.phase();
        if !matches!(*phase, Phase::Idle) {
            return Err(LesewerkError::ConfigFrozen);
        }
        *self.config.lock().expect("mission config lock poisoned") = config;
        Ok(())
    }

    pub fn config(&self) -> MissionConfig {
        self.config.lock().expect("mission config lock poisoned").clone()
    }

    /// Append jobs.  Accepted while idle or during an active run.
    #[instrument(skip(self, specs), fields(mission_id = %self.id, jobs = specs.len()))]
    pub fn enqueue(&self, specs: Vec<JobSpec>) -> Result<usize> {
        let phase = self.phase();
        match &*phase {
            Phase::Idle => Ok(self.queue.enqueue_all(specs)?.len()),
            Phase::Running(active) | Phase::Paused(active) => {
                // Registered under the writer lock so no worker can record a
                // page before its document knows how many pages to expect.
                let mut writer = active.writer.lock().expect("result writer lock poisoned");
                let jobs = self.queue.enqueue_all(specs)?;
                for job in &jobs {
                    writer.register(job);
                }
                drop(writer);
                active.pool.wake();
                Ok(jobs.len())
            }
            other => Err(LesewerkError::MissionClosed(other.state())),
        }
    }

    /// Leave `Idle`: lease the engine, open the writer, start the workers.
    #[instrument(skip(self), fields(mission_id = %self.id, mission = %self.name))]
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut phase = self.phase();
        if !matches!(*phase, Phase::Idle) {
            return Err(LesewerkError::InvalidTransition {
                from: phase.state(),
                event: "start",
            });
        }

        let config = Arc::new(self.config());
        let lease = self.slot.acquire()?;
        let binding = Arc::clone(lease.binding());

        let jobs = self.queue.snapshot();
        let output_dir = self.output_dir(&config, jobs.first().map(|j| &j.source));
        let setup = WriterSetup::from_config(&config, self.name.clone(), output_dir, Local::now());
        let mut writer = ResultWriter::new(setup)?;
        for job in &jobs {
            writer.register(job);
        }
        let abort = writer.abort_handle();
        let writer = Arc::new(Mutex::new(writer));

        let limit = binding.limit();
        let workers = config.concurrency.unwrap_or(limit).min(limit).max(1);
        let (events, receiver) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(
            PoolContext {
                mission_id: self.id,
                queue: Arc::clone(&self.queue),
                binding,
                writer: Arc::clone(&writer),
                config,
                settings: self.settings,
                events,
            },
            workers,
        );

        info!(jobs = jobs.len(), workers, engine = %lease.binding().id(), "Mission started");
        *phase = Phase::Running(Active {
            started_at: Instant::now(),
            lease,
            pool,
            writer,
            abort,
        });
        drop(phase);

        tokio::spawn(Arc::clone(self).supervise(receiver));
        Ok(())
    }

    /// Stop handing out new jobs.  Claimed jobs run to completion.
    pub fn pause(&self) -> Result<()> {
        let mut phase = self.phase();
        match std::mem::replace(&mut *phase, Phase::Idle) {
            Phase::Running(active) => {
                self.queue.hold();
                *phase = Phase::Paused(active);
                info!(mission_id = %self.id, "Mission paused");
                Ok(())
            }
            other => {
                let from = other.state();
                *phase = other;
                Err(LesewerkError::InvalidTransition { from, event: "pause" })
            }
        }
    }

    pub fn resume(&self) -> Result<()> {
        let mut phase = self.phase();
        match std::mem::replace(&mut *phase, Phase::Idle) {
            Phase::Paused(active) => {
                self.queue.release();
                active.pool.wake();
                *phase = Phase::Running(active);
                info!(mission_id = %self.id, "Mission resumed");
                Ok(())
            }
            other => {
                let from = other.state();
                *phase = other;
                Err(LesewerkError::InvalidTransition { from, event: "resume" })
            }
        }
    }

    /// Abandon all remaining and in-flight work.
    ///
    /// On return no job is pending and nothing more will be written.  During
    /// `Saving` the flush is aborted and any partial paginated file removed.
    #[instrument(skip(self), fields(mission_id = %self.id))]
    pub fn force_terminate(&self) -> Result<()> {
        let mut phase = self.phase();
        match std::mem::replace(&mut *phase, Phase::Idle) {
            Phase::Running(active) | Phase::Paused(active) => {
                *phase = Phase::Stopped(self.abandon(active, StopReason::Terminated));
                Ok(())
            }
            Phase::Saving(flushing) => {
                flushing.abort.store(true, Ordering::SeqCst);
                warn!("Force-terminate during save; partial output will be removed");
                *phase = Phase::Stopped(Ended {
                    elapsed: flushing.started_at.elapsed(),
                    engine: flushing.lease.binding().id().to_string(),
                    artifacts: Vec::new(),
                    reason: Some(StopReason::Terminated),
                });
                Ok(())
            }
            other => {
                let from = other.state();
                *phase = other;
                Err(LesewerkError::InvalidTransition {
                    from,
                    event: "force-terminate",
                })
            }
        }
    }

    /// Cheap snapshot for polling.
    pub fn status(&self) -> MissionStatus {
        let phase = self.phase();
        let state = phase.state();
        let (elapsed, engine, artifacts, stop_reason) = match &*phase {
            Phase::Idle => (Duration::ZERO, None, Vec::new(), None),
            Phase::Running(a) | Phase::Paused(a) => (
                a.started_at.elapsed(),
                Some(a.lease.binding().id().to_string()),
                Vec::new(),
                None,
            ),
            Phase::Saving(f) => (
                f.started_at.elapsed(),
                Some(f.lease.binding().id().to_string()),
                Vec::new(),
                None,
            ),
            Phase::Stopped(e) | Phase::Completed(e) => (
                e.elapsed,
                Some(e.engine.clone()),
                e.artifacts.clone(),
                e.reason.clone(),
            ),
        };
        drop(phase);

        MissionStatus {
            id: self.id,
            name: self.name.clone(),
            state,
            counts: self.queue.counts(),
            elapsed_ms: elapsed.as_millis() as u64,
            engine,
            interruptible: matches!(state, MissionState::Running | MissionState::Paused),
            failures: self.failures(),
            artifacts,
            stop_reason,
        }
    }

    pub fn failures(&self) -> Vec<FailedJob> {
        self.queue.failures()
    }

    // -- internals --

    fn output_dir(&self, config: &MissionConfig, first: Option<&JobSource>) -> PathBuf {
        if let Some(dir) = &config.output_dir {
            return dir.clone();
        }
        first
            .and_then(JobSource::path)
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.fallback_dir.clone())
    }

    /// Tear down an active run.  Called with the phase lock held.
    fn abandon(&self, active: Active, reason: StopReason) -> Ended {
        active.abort.store(true, Ordering::SeqCst);
        let report = self.queue.cancel_all();
        active.pool.cancel();
        active
            .writer
            .lock()
            .expect("result writer lock poisoned")
            .discard();
        info!(
            mission_id = %self.id,
            pending = report.pending,
            running = report.running,
            ?reason,
            "Mission stopped"
        );
        Ended {
            elapsed: active.started_at.elapsed(),
            engine: active.lease.binding().id().to_string(),
            artifacts: active.writer.lock().expect("result writer lock poisoned").artifacts(),
            reason: Some(reason),
        }
    }

    fn stop_fatal(&self, reason: String) {
        let mut phase = self.phase();
        match std::mem::replace(&mut *phase, Phase::Idle) {
            Phase::Running(active) | Phase::Paused(active) => {
                error!(mission_id = %self.id, %reason, "Fatal mission error");
                *phase = Phase::Stopped(self.abandon(active, StopReason::Fatal(reason)));
            }
            other => *phase = other,
        }
    }

    /// Move to `Saving` once every job is terminal and nothing is in flight.
    fn settle(&self) -> Settle {
        let mut phase = self.phase();
        let Some(active) = phase.active() else {
            return Settle::Gone;
        };
        if !self.queue.is_drained() || active.pool.in_flight() > 0 {
            return Settle::Busy;
        }
        self.queue.close();

        let (Phase::Running(active) | Phase::Paused(active)) =
            std::mem::replace(&mut *phase, Phase::Idle)
        else {
            return Settle::Gone;
        };
        let writer = Arc::clone(&active.writer);
        info!(mission_id = %self.id, "All jobs terminal, saving results");
        *phase = Phase::Saving(Flushing {
            started_at: active.started_at,
            lease: active.lease,
            abort: active.abort,
        });
        Settle::Flush(writer)
    }

    async fn flush(&self, writer: Arc<Mutex<ResultWriter>>) {
        let result = tokio::task::spawn_blocking(move || {
            writer.lock().expect("result writer lock poisoned").finish()
        })
        .await;

        let mut phase = self.phase();
        let Phase::Saving(flushing) = std::mem::replace(&mut *phase, Phase::Idle) else {
            // Terminated while saving; the Stopped record stays.
            return;
        };
        let mut ended = Ended {
            elapsed: flushing.started_at.elapsed(),
            engine: flushing.lease.binding().id().to_string(),
            artifacts: Vec::new(),
            reason: None,
        };
        *phase = match result {
            Ok(Ok(artifacts)) => {
                info!(mission_id = %self.id, artifacts = artifacts.len(), "Mission completed");
                ended.artifacts = artifacts;
                Phase::Completed(ended)
            }
            Ok(Err(e)) => {
                error!(mission_id = %self.id, error = %e, "Saving results failed");
                ended.reason = Some(StopReason::Fatal(e.to_string()));
                Phase::Stopped(ended)
            }
            Err(e) => {
                ended.reason = Some(StopReason::Fatal(format!("flush task failed: {e}")));
                Phase::Stopped(ended)
            }
        };
    }

    /// Drive the mission from worker events until it leaves its active run.
    async fn supervise(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<PoolEvent>) {
        loop {
            match self.settle() {
                Settle::Flush(writer) => return self.flush(writer).await,
                Settle::Gone => return,
                Settle::Busy => {}
            }
            match events.recv().await {
                Some(PoolEvent::Fatal(reason)) => return self.stop_fatal(reason),
                Some(PoolEvent::JobFinished { .. } | PoolEvent::Idle) => {}
                None => return,
            }
        }
    }
}

impl std::fmt::Debug for MissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MissionController")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
