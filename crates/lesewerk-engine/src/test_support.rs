// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Scripted recognition backend for tests.
//
// The outcome is chosen from the source name: names containing "empty" yield
// no text, names containing "fail" yield a backend failure, anything else
// yields one block holding the file stem.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lesewerk_core::error::JobFailure;
use lesewerk_core::{EngineCapabilities, InputKind, Recognition, TextBlock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::engine::{RecognitionBackend, RecognitionRequest};

pub(crate) struct ScriptedBackend {
    id: String,
    max_concurrency: AtomicUsize,
    delay: Mutex<Duration>,
    gated: AtomicBool,
    gate: Semaphore,
    stubborn: AtomicBool,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedBackend {
    pub fn named(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            max_concurrency: AtomicUsize::new(64),
            delay: Mutex::new(Duration::ZERO),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
            stubborn: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.delay.lock().expect("delay lock poisoned") = delay;
        self
    }

    pub fn with_max_concurrency(self: Arc<Self>, n: usize) -> Arc<Self> {
        self.max_concurrency.store(n, Ordering::SeqCst);
        self
    }

    /// Calls block until `release` lets them through.
    pub fn gated(self: Arc<Self>) -> Arc<Self> {
        self.gated.store(true, Ordering::SeqCst);
        self
    }

    /// Calls ignore their cancellation token and run to the end.
    pub fn stubborn(self: Arc<Self>) -> Arc<Self> {
        self.stubborn.store(true, Ordering::SeqCst);
        self
    }

    pub fn release(&self, calls: usize) {
        self.gate.add_permits(calls);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn work(&self, request: &RecognitionRequest) -> Result<Recognition, JobFailure> {
        let delay = *self.delay.lock().expect("delay lock poisoned");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.gated.load(Ordering::SeqCst) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }

        let name = request.source.display_name();
        if name.contains("fail") {
            return Err(JobFailure::Backend("scripted failure".into()));
        }
        if name.contains("empty") {
            return Ok(Recognition::default());
        }
        Ok(Recognition::from_blocks(vec![TextBlock::new(
            request.source.stem(),
            10.0,
            10.0,
            120.0,
            30.0,
            0.9,
        )]))
    }
}

#[async_trait]
impl RecognitionBackend for ScriptedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            supported_inputs: vec![InputKind::Image, InputKind::Text],
            max_concurrency: self.max_concurrency.load(Ordering::SeqCst),
        }
    }

    async fn recognize(
        &self,
        request: RecognitionRequest,
        cancel: CancellationToken,
    ) -> Result<Recognition, JobFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = if self.stubborn.load(Ordering::SeqCst) {
            self.work(&request).await
        } else {
            tokio::select! {
                _ = cancel.cancelled() => Err(JobFailure::Backend("cancelled".into())),
                result = self.work(&request) => result,
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Poll `check` until it holds or two seconds pass.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
