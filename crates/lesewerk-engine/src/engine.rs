// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Engine binding: the single active recognition backend.
//
// `EngineSlot` owns the process-wide binding.  Missions take an `EngineLease`
// when they start and drop it when they end; `apply()` swaps the binding under
// the write lock and refuses while any lease is outstanding, so a mission
// always dispatches against the binding it started with.
//
// The slot's ceiling semaphore is the global concurrency limit: every
// binding it ever creates draws permits from that one pool.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use lesewerk_core::error::{JobFailure, LesewerkError, Result};
use lesewerk_core::{
    AppConfig, EngineCapabilities, EngineDescriptor, ExtractionMode, InputKind, Job, JobSource,
    Recognition,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

// ---------------------------------------------------------------------------
// Backend contract
// ---------------------------------------------------------------------------

/// Input for one backend call.
#[derive(Debug, Clone)]
pub struct RecognitionRequest {
    pub job_index: usize,
    pub source: JobSource,
    pub kind: InputKind,
    /// 1-based page for document inputs.
    pub page: Option<u32>,
    pub password: Option<String>,
    pub extraction: ExtractionMode,
}

impl RecognitionRequest {
    pub fn for_job(job: &Job, extraction: ExtractionMode) -> Self {
        Self {
            job_index: job.index,
            source: job.source.clone(),
            kind: job.kind,
            page: job.page,
            password: job.password.clone(),
            extraction,
        }
    }
}

/// A pluggable recognition capability.
///
/// Implementations should check `cancel` at safe points and return early once
/// it fires; whatever they return after cancellation is discarded.
#[async_trait]
pub trait RecognitionBackend: Send + Sync {
    fn id(&self) -> &str;

    fn capabilities(&self) -> EngineCapabilities;

    async fn recognize(
        &self,
        request: RecognitionRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<Recognition, JobFailure>;
}

/// Builds a backend on demand.  Construction may be expensive (model loading).
pub type BackendFactory =
    Arc<dyn Fn() -> Result<Arc<dyn RecognitionBackend>> + Send + Sync>;

/// Backends available for binding, by id.
#[derive(Clone, Default)]
pub struct EngineCatalog {
    factories: BTreeMap<String, BackendFactory>,
}

impl EngineCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, factory: BackendFactory) {
        self.factories.insert(id.into(), factory);
    }

    /// Register an already-built backend under its own id.
    pub fn register_instance(&mut self, backend: Arc<dyn RecognitionBackend>) {
        let id = backend.id().to_string();
        self.register(id, Arc::new(move || Ok(Arc::clone(&backend))));
    }

    pub fn ids(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn create(&self, id: &str) -> Result<Arc<dyn RecognitionBackend>> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| LesewerkError::UnknownEngine(id.to_string()))?;
        factory()
    }
}

impl fmt::Debug for EngineCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCatalog").field("ids", &self.ids()).finish()
    }
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// Timeout and cancellation grace for backend calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSettings {
    pub timeout: Duration,
    pub grace: Duration,
}

impl CallSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.call_timeout_ms),
            grace: Duration::from_millis(config.cancel_grace_ms),
        }
    }
}

impl Default for CallSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Result of one dispatched call.
#[derive(Debug)]
pub enum CallOutcome {
    Completed(std::result::Result<Recognition, JobFailure>),
    /// The mission cancelled the call; any eventual result is dropped.
    Cancelled,
}

/// Permit pools a binding draws from.
///
/// The ceiling pool belongs to the slot and outlives every binding, so calls
/// detached from an old binding still count against the ceiling after a
/// re-apply.  The backend pool enforces the backend's own limit and is kept
/// per backend id for the same reason.
#[derive(Clone)]
pub struct PermitPools {
    ceiling: Arc<Semaphore>,
    backend: Arc<Semaphore>,
}

impl PermitPools {
    fn standalone(ceiling: usize, limit: usize) -> Self {
        Self {
            ceiling: Arc::new(Semaphore::new(ceiling)),
            backend: Arc::new(Semaphore::new(limit)),
        }
    }
}

/// One bound backend with its share of the concurrency ceiling.
pub struct EngineBinding {
    backend: Arc<dyn RecognitionBackend>,
    descriptor: EngineDescriptor,
    pools: PermitPools,
    limit: usize,
}

impl EngineBinding {
    /// Bind `backend` with private pools, capping calls at
    /// `min(ceiling, backend limit)`.
    pub fn new(backend: Arc<dyn RecognitionBackend>, ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        let limit = ceiling.min(backend.capabilities().max_concurrency).max(1);
        Self::with_pools(backend, PermitPools::standalone(ceiling, limit), limit)
    }

    fn with_pools(backend: Arc<dyn RecognitionBackend>, pools: PermitPools, limit: usize) -> Self {
        let descriptor = EngineDescriptor {
            id: backend.id().to_string(),
            capabilities: backend.capabilities(),
        };
        Self {
            backend,
            descriptor,
            pools,
            limit,
        }
    }

    pub fn descriptor(&self) -> &EngineDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Maximum simultaneous calls across all missions.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Dispatch one request.
    ///
    /// The call runs in its own task holding a backend permit and a ceiling
    /// permit.  On timeout or cancellation the backend's token is cancelled
    /// and the call gets `settings.grace` to wind down; after that it is
    /// detached, keeps its permits until it returns, and its result is
    /// dropped.
    #[instrument(skip(self, request, cancel, settings), fields(engine = %self.descriptor.id, job_index = request.job_index))]
    pub async fn call(
        &self,
        request: RecognitionRequest,
        cancel: &CancellationToken,
        settings: CallSettings,
    ) -> CallOutcome {
        if !self.descriptor.capabilities.supports(request.kind) {
            return CallOutcome::Completed(Err(JobFailure::UnsupportedInput(format!(
                "{} does not accept {:?} input",
                self.descriptor.id, request.kind
            ))));
        }

        // Backend pool first, then the ceiling, in every call.
        let acquire = async {
            let backend = Arc::clone(&self.pools.backend).acquire_owned().await?;
            let ceiling = Arc::clone(&self.pools.ceiling).acquire_owned().await?;
            Ok::<_, tokio::sync::AcquireError>((backend, ceiling))
        };
        let permits = tokio::select! {
            _ = cancel.cancelled() => return CallOutcome::Cancelled,
            permits = acquire => permits,
        };
        let Ok(permits) = permits else {
            return CallOutcome::Completed(Err(JobFailure::BackendUnavailable(
                "engine binding closed".into(),
            )));
        };

        let token = cancel.child_token();
        let backend = Arc::clone(&self.backend);
        let call_token = token.clone();
        let mut handle = tokio::spawn(async move {
            let _permits = permits;
            backend.recognize(request, call_token).await
        });

        tokio::select! {
            joined = &mut handle => CallOutcome::Completed(flatten(joined)),
            _ = tokio::time::sleep(settings.timeout) => {
                token.cancel();
                if tokio::time::timeout(settings.grace, &mut handle).await.is_err() {
                    warn!("backend ignored cancellation after timeout, detaching call");
                }
                CallOutcome::Completed(Err(JobFailure::Timeout(settings.timeout.as_millis() as u64)))
            }
            _ = cancel.cancelled() => {
                if tokio::time::timeout(settings.grace, &mut handle).await.is_err() {
                    warn!("backend ignored cancellation, detaching call");
                }
                CallOutcome::Cancelled
            }
        }
    }
}

fn flatten(
    joined: std::result::Result<std::result::Result<Recognition, JobFailure>, tokio::task::JoinError>,
) -> std::result::Result<Recognition, JobFailure> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(JobFailure::Backend(format!("backend task failed: {e}"))),
    }
}

impl fmt::Debug for EngineBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBinding")
            .field("descriptor", &self.descriptor)
            .field("limit", &self.limit)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Slot and leases
// ---------------------------------------------------------------------------

/// Holds the active binding and counts the missions using it.
pub struct EngineSlot {
    catalog: EngineCatalog,
    current: RwLock<Option<Arc<EngineBinding>>>,
    leases: Arc<AtomicUsize>,
    ceiling: usize,
    ceiling_permits: Arc<Semaphore>,
    /// Backend pools by id, with the limit each was sized for.
    backend_permits: Mutex<BTreeMap<String, (Arc<Semaphore>, usize)>>,
}

impl EngineSlot {
    pub fn new(catalog: EngineCatalog, ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            catalog,
            current: RwLock::new(None),
            leases: Arc::new(AtomicUsize::new(0)),
            ceiling,
            ceiling_permits: Arc::new(Semaphore::new(ceiling)),
            backend_permits: Mutex::new(BTreeMap::new()),
        }
    }

    /// Pools for `backend`, reusing the ones handed out on earlier applies.
    fn pools_for(&self, backend: &dyn RecognitionBackend) -> (PermitPools, usize) {
        let mut pools = self.backend_permits.lock().expect("engine permits lock poisoned");
        let (semaphore, limit) = pools
            .entry(backend.id().to_string())
            .or_insert_with(|| {
                let limit = self.ceiling.min(backend.capabilities().max_concurrency).max(1);
                (Arc::new(Semaphore::new(limit)), limit)
            })
            .clone();
        let pools = PermitPools {
            ceiling: Arc::clone(&self.ceiling_permits),
            backend: semaphore,
        };
        (pools, limit)
    }

    /// Ceiling permits not currently held by any call.
    pub fn available_permits(&self) -> usize {
        self.ceiling_permits.available_permits()
    }

    pub fn catalog(&self) -> &EngineCatalog {
        &self.catalog
    }

    /// Missions currently holding the binding.
    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Option<EngineDescriptor> {
        self.current
            .read()
            .expect("engine lock poisoned")
            .as_ref()
            .map(|b| b.descriptor().clone())
    }

    /// Replace the active binding.
    ///
    /// The backend is built before the exclusive section; the swap itself
    /// fails with `EngineBusy` while any lease is outstanding and leaves the
    /// previous binding in place.
    #[instrument(skip(self))]
    pub fn apply(&self, id: &str) -> Result<EngineDescriptor> {
        if self.active_leases() > 0 {
            return Err(LesewerkError::EngineBusy {
                active: self.active_leases(),
            });
        }
        let backend = self.catalog.create(id)?;
        let (pools, limit) = self.pools_for(backend.as_ref());
        let binding = Arc::new(EngineBinding::with_pools(backend, pools, limit));

        let mut current = self.current.write().expect("engine lock poisoned");
        let active = self.leases.load(Ordering::SeqCst);
        if active > 0 {
            return Err(LesewerkError::EngineBusy { active });
        }
        let descriptor = binding.descriptor().clone();
        let limit = binding.limit();
        *current = Some(binding);
        info!(engine = %descriptor.id, limit, "Recognition engine bound");
        Ok(descriptor)
    }

    /// Take a lease on the current binding for the lifetime of one mission.
    pub fn acquire(&self) -> Result<EngineLease> {
        let current = self.current.read().expect("engine lock poisoned");
        let binding = current
            .as_ref()
            .cloned()
            .ok_or_else(|| LesewerkError::BackendInit("no recognition engine is bound".into()))?;
        let held = self.leases.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(engine = %binding.id(), leases = held, "engine lease taken");
        Ok(EngineLease {
            binding,
            leases: Arc::clone(&self.leases),
        })
    }
}

/// A mission's claim on the active binding.  Dropping it releases the claim.
pub struct EngineLease {
    binding: Arc<EngineBinding>,
    leases: Arc<AtomicUsize>,
}

impl EngineLease {
    pub fn binding(&self) -> &Arc<EngineBinding> {
        &self.binding
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        let left = self.leases.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(engine = %self.binding.id(), leases = left, "engine lease released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedBackend;
    use lesewerk_core::JobSpec;

    fn slot_with(backends: Vec<Arc<ScriptedBackend>>, ceiling: usize) -> EngineSlot {
        let mut catalog = EngineCatalog::new();
        for backend in backends {
            catalog.register_instance(backend);
        }
        EngineSlot::new(catalog, ceiling)
    }

    fn request(name: &str, kind: InputKind) -> RecognitionRequest {
        let mut job = Job::from_spec(0, JobSpec::image(format!("/in/{name}")));
        job.kind = kind;
        RecognitionRequest::for_job(&job, ExtractionMode::Mixed)
    }

    #[test]
    fn swap_is_refused_while_leased() {
        let slot = slot_with(
            vec![ScriptedBackend::named("alpha"), ScriptedBackend::named("beta")],
            4,
        );
        slot.apply("alpha").unwrap();
        let lease = slot.acquire().unwrap();

        let err = slot.apply("beta").unwrap_err();
        assert!(matches!(err, LesewerkError::EngineBusy { active: 1 }));
        assert_eq!(slot.current().unwrap().id, "alpha");

        drop(lease);
        slot.apply("beta").unwrap();
        assert_eq!(slot.acquire().unwrap().binding().id(), "beta");
    }

    #[test]
    fn unknown_engine_is_rejected() {
        let slot = slot_with(vec![ScriptedBackend::named("alpha")], 1);
        assert!(matches!(slot.apply("nope"), Err(LesewerkError::UnknownEngine(_))));
        assert!(slot.acquire().is_err());
    }

    #[test]
    fn limit_is_capped_by_backend() {
        let backend = ScriptedBackend::named("alpha").with_max_concurrency(2);
        let binding = EngineBinding::new(backend, 8);
        assert_eq!(binding.limit(), 2);
    }

    #[tokio::test]
    async fn unsupported_input_never_reaches_backend() {
        let backend = ScriptedBackend::named("alpha");
        let binding = EngineBinding::new(backend.clone(), 2);
        let outcome = binding
            .call(
                request("doc.pdf", InputKind::Document),
                &CancellationToken::new(),
                CallSettings::default(),
            )
            .await;
        assert!(matches!(
            outcome,
            CallOutcome::Completed(Err(JobFailure::UnsupportedInput(_)))
        ));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let backend = ScriptedBackend::named("slow").with_delay(Duration::from_secs(5));
        let binding = EngineBinding::new(backend, 1);
        let settings = CallSettings {
            timeout: Duration::from_millis(50),
            grace: Duration::from_millis(50),
        };
        let outcome = binding
            .call(request("a.png", InputKind::Image), &CancellationToken::new(), settings)
            .await;
        assert!(matches!(outcome, CallOutcome::Completed(Err(JobFailure::Timeout(50)))));
    }

    #[tokio::test]
    async fn cancelled_call_reports_cancelled() {
        let backend = ScriptedBackend::named("slow").with_delay(Duration::from_secs(5));
        let binding = Arc::new(EngineBinding::new(backend, 1));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let outcome = binding
            .call(request("a.png", InputKind::Image), &cancel, CallSettings::default())
            .await;
        assert!(matches!(outcome, CallOutcome::Cancelled));
    }

    #[tokio::test]
    async fn detached_calls_keep_counting_after_reapply() {
        let backend = ScriptedBackend::named("stubborn")
            .stubborn()
            .with_delay(Duration::from_millis(300));
        let slot = slot_with(vec![backend.clone()], 1);
        slot.apply("stubborn").unwrap();
        let settings = CallSettings {
            timeout: Duration::from_secs(5),
            grace: Duration::from_millis(10),
        };

        // First mission: its call is cancelled and detached while running.
        let lease = slot.acquire().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let outcome = lease
            .binding()
            .call(request("a.png", InputKind::Image), &cancel, settings)
            .await;
        assert!(matches!(outcome, CallOutcome::Cancelled));
        drop(lease);
        assert_eq!(slot.available_permits(), 0);

        // Re-binding the same engine must not mint a fresh permit.
        slot.apply("stubborn").unwrap();
        let lease = slot.acquire().unwrap();
        let outcome = lease
            .binding()
            .call(request("b.png", InputKind::Image), &CancellationToken::new(), settings)
            .await;
        assert!(matches!(outcome, CallOutcome::Completed(Ok(_))));
        assert_eq!(backend.calls(), 2);
        assert_eq!(backend.peak(), 1);
        assert_eq!(slot.available_permits(), 1);
    }
}
