//! Worker-side request handling: credential enforcement, idempotence, schema
//! checks and bounded concurrent execution.

pub mod dedup;
pub mod sessions;
pub mod stats;

pub use dedup::{fingerprint, Claim, DedupCache, DedupGuard, Lookup, RequestKey};
pub use sessions::SessionValidator;
pub use stats::{StatsSnapshot, WorkerStats};

use crate::executor::{CancelSignal, ExecutorError, ModelExecutor};
use crate::model::{ModelStats, ModelStore, ResidentModel, StoreError};
use infermesh_common::wire::{
    BatchExecuteRequest, BatchExecuteResponse, BatchItem, ExecuteRequest, ExecuteResponse,
    HeartbeatRequest, LoadModelResponse, SessionGrant, Timing,
};
use infermesh_common::{
    validate_tensors, AcceleratorClass, ErrorBody, ErrorKind, ModelRef, ModelVersion,
    NamedTensors, WorkerCapabilities,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Upper bound on items in one batch execute.
pub const MAX_BATCH_ITEMS: usize = 256;

/// Running executions by `(credential, request_id)`.
type CancelMap = Arc<Mutex<HashMap<(String, String), CancelSignal>>>;

/// Settings the runtime needs, derived from the worker configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub worker_id: String,
    pub capabilities: WorkerCapabilities,
    pub default_deadline: Duration,
    pub max_resident_models: usize,
    pub idle_unload: Option<Duration>,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
}

impl RuntimeConfig {
    pub fn from_config(config: &crate::WorkerConfig, capabilities: WorkerCapabilities) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            capabilities,
            default_deadline: config.default_deadline(),
            max_resident_models: config.max_resident_models,
            idle_unload: config.idle_unload(),
            dedup_capacity: config.dedup_capacity,
            dedup_ttl: config.dedup_ttl(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capabilities.max_concurrent_sessions
    }
}

impl From<StoreError> for ErrorBody {
    fn from(e: StoreError) -> Self {
        let kind = match &e {
            StoreError::Unavailable => ErrorKind::Unavailable,
            StoreError::Load(
                ExecutorError::UnsupportedArtifact(_) | ExecutorError::InvalidArtifact(_),
            ) => ErrorKind::BadRequest,
            StoreError::Load(_) => ErrorKind::ExecutionError,
        };
        ErrorBody::new(kind, e.to_string())
    }
}

pub struct WorkerRuntime {
    config: RuntimeConfig,
    store: Arc<ModelStore>,
    validator: Arc<dyn SessionValidator>,
    dedup: DedupCache,
    permits: Arc<Semaphore>,
    stats: Arc<WorkerStats>,
    cancels: CancelMap,
}

impl WorkerRuntime {
    pub fn new(
        config: RuntimeConfig,
        executor: Arc<dyn ModelExecutor>,
        validator: Arc<dyn SessionValidator>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.capacity() as usize));
        Self {
            store: Arc::new(ModelStore::new(executor, config.max_resident_models)),
            dedup: DedupCache::new(config.dedup_capacity, config.dedup_ttl),
            validator,
            permits,
            stats: Arc::new(WorkerStats::new()),
            cancels: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn capabilities(&self) -> &WorkerCapabilities {
        &self.config.capabilities
    }

    /// Executions currently holding a capacity permit.
    pub fn in_flight(&self) -> u32 {
        self.config
            .capacity()
            .saturating_sub(self.permits.available_permits() as u32)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn model_stats(&self) -> Result<Vec<ModelStats>, ErrorBody> {
        Ok(self.store.stats()?)
    }

    pub fn loaded_models(&self) -> Result<Vec<ModelRef>, ErrorBody> {
        Ok(self.store.loaded()?)
    }

    /// Version and counters of a resident model.
    pub fn model_info(
        &self,
        model: &ModelRef,
    ) -> Result<(Arc<ModelVersion>, ModelStats), ErrorBody> {
        self.store.info(model)?.ok_or_else(|| {
            ErrorBody::new(
                ErrorKind::NotFound,
                format!("model {} is not loaded on worker {}", model, self.worker_id()),
            )
        })
    }

    pub fn dedup_entries(&self) -> usize {
        self.dedup.len()
    }

    /// Run one credentialed request.
    ///
    /// Always yields a response; failures are carried in `error`. The
    /// execution itself runs on a detached task, so a caller that hits its
    /// deadline or goes away does not lose the outcome for a retry.
    #[instrument(skip(self, request), fields(request_id = %request.request_id))]
    pub async fn execute(&self, request: ExecuteRequest) -> Arc<ExecuteResponse> {
        let started = Instant::now();
        let request_id = request.request_id.clone();
        let deadline = self.deadline(request.deadline_ms);

        match tokio::time::timeout(deadline, self.execute_inner(request, started)).await {
            Ok(response) => response,
            Err(_) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "Execute deadline exceeded");
                self.reject(None, &request_id, deadline_exceeded(deadline), started)
            }
        }
    }

    fn deadline(&self, deadline_ms: Option<u64>) -> Duration {
        deadline_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_deadline)
    }

    async fn execute_inner(&self, request: ExecuteRequest, started: Instant) -> Arc<ExecuteResponse> {
        let ExecuteRequest {
            credential,
            request_id,
            inputs,
            ..
        } = request;
        let fingerprint = fingerprint(&inputs);

        if let Some(prior) = self.replay(&credential, &request_id, &fingerprint).await {
            return prior;
        }

        let grant = match self.validator.validate(&credential, &self.config.worker_id).await {
            Ok(grant) => grant,
            Err(error) => {
                // A concurrent duplicate may have consumed the credential first.
                if let Some(prior) = self.replay(&credential, &request_id, &fingerprint).await {
                    return prior;
                }
                return self.reject(None, &request_id, error, started);
            }
        };

        self.run_granted(&grant, &credential, request_id, inputs, fingerprint, started)
            .await
    }

    /// Run several input sets under one credential, in order.
    ///
    /// The credential is validated once for the whole batch. Each item is
    /// deduplicated and checked on its own, so one bad item does not fail
    /// the others.
    #[instrument(skip(self, request), fields(items = request.items.len()))]
    pub async fn execute_batch(&self, request: BatchExecuteRequest) -> BatchExecuteResponse {
        let started = Instant::now();

        if request.items.is_empty() || request.items.len() > MAX_BATCH_ITEMS {
            self.stats.record_rejection();
            return BatchExecuteResponse::failed(
                ErrorBody::new(
                    ErrorKind::BadRequest,
                    format!(
                        "batch must hold between 1 and {} items, got {}",
                        MAX_BATCH_ITEMS,
                        request.items.len()
                    ),
                ),
                elapsed_ms(started),
            );
        }

        let deadline = self.deadline(request.deadline_ms);
        match tokio::time::timeout(deadline, self.execute_batch_inner(request, started)).await {
            Ok(response) => response,
            Err(_) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "Batch deadline exceeded");
                self.stats.record_rejection();
                BatchExecuteResponse::failed(deadline_exceeded(deadline), elapsed_ms(started))
            }
        }
    }

    async fn execute_batch_inner(
        &self,
        request: BatchExecuteRequest,
        started: Instant,
    ) -> BatchExecuteResponse {
        let BatchExecuteRequest {
            credential, items, ..
        } = request;
        let items: Vec<(BatchItem, String)> = items
            .into_iter()
            .map(|item| {
                let fingerprint = fingerprint(&item.inputs);
                (item, fingerprint)
            })
            .collect();

        if let Some(prior) = self.replay_batch(&credential, &items).await {
            return BatchExecuteResponse::collect(prior, elapsed_ms(started));
        }

        let grant = match self.validator.validate(&credential, &self.config.worker_id).await {
            Ok(grant) => grant,
            Err(error) => {
                if let Some(prior) = self.replay_batch(&credential, &items).await {
                    return BatchExecuteResponse::collect(prior, elapsed_ms(started));
                }
                debug!(kind = %error.kind, "Batch rejected");
                self.stats.record_rejection();
                return BatchExecuteResponse::failed(error, elapsed_ms(started));
            }
        };

        let mut responses = Vec::with_capacity(items.len());
        for (item, fingerprint) in items {
            let item_started = Instant::now();
            responses.push(
                self.run_granted(
                    &grant,
                    &credential,
                    item.request_id,
                    item.inputs,
                    fingerprint,
                    item_started,
                )
                .await,
            );
        }
        BatchExecuteResponse::collect(responses, elapsed_ms(started))
    }

    /// Everything after credential validation, for one request.
    async fn run_granted(
        &self,
        grant: &SessionGrant,
        credential: &str,
        request_id: String,
        inputs: NamedTensors,
        fingerprint: String,
        started: Instant,
    ) -> Arc<ExecuteResponse> {
        let key = RequestKey {
            client: grant.client.clone(),
            model: grant.model.clone(),
            request_id: request_id.clone(),
            fingerprint,
        };
        let guard = match self.dedup.claim(key, credential) {
            Claim::Owner(guard) => guard,
            Claim::Existing(prior) => {
                return match prior.resolve().await {
                    Some(response) => {
                        self.stats.record_dedup_hit();
                        response
                    }
                    None => self.reject(
                        None,
                        &request_id,
                        ErrorBody::new(
                            ErrorKind::Unavailable,
                            "previous attempt was abandoned; retry",
                        ),
                        started,
                    ),
                };
            }
        };

        let resident = match self.store.get(&grant.model) {
            Ok(Some(resident)) => resident,
            Ok(None) => {
                let error = ErrorBody::new(
                    ErrorKind::ModelNotLoaded,
                    format!("model {} is not loaded on worker {}", grant.model, self.worker_id()),
                );
                return self.reject(Some(guard), &request_id, error, started);
            }
            Err(e) => return self.reject(Some(guard), &request_id, e.into(), started),
        };

        if let Err(violation) = validate_tensors(&resident.version.schema.inputs, &inputs) {
            let error = ErrorBody::new(ErrorKind::SchemaMismatch, violation.to_string());
            return self.reject(Some(guard), &request_id, error, started);
        }

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let error = ErrorBody::new(
                    ErrorKind::Unavailable,
                    format!("worker {} is at capacity", self.worker_id()),
                );
                return self.reject(Some(guard), &request_id, error, started);
            }
        };

        let cancel = CancelSignal::new();
        let cancel_key = (credential.to_string(), request_id.clone());
        if let Ok(mut cancels) = self.cancels.lock() {
            cancels.insert(cancel_key.clone(), cancel.clone());
        }

        let job = Execution {
            request_id: request_id.clone(),
            model: grant.model.clone(),
            resident,
            inputs,
            cancel,
            cancel_key,
            started,
            store: self.store.clone(),
            stats: self.stats.clone(),
            cancels: self.cancels.clone(),
        };

        match tokio::spawn(job.run(guard, permit)).await {
            Ok(response) => response,
            Err(e) => Arc::new(ExecuteResponse::failed(
                request_id,
                ErrorBody::new(ErrorKind::Internal, format!("execution task failed: {}", e)),
                elapsed_timing(started),
            )),
        }
    }

    async fn replay(
        &self,
        credential: &str,
        request_id: &str,
        fingerprint: &str,
    ) -> Option<Arc<ExecuteResponse>> {
        let response = self
            .dedup
            .lookup_token(credential, request_id, fingerprint)?
            .resolve()
            .await?;
        self.stats.record_dedup_hit();
        debug!(request_id, "Answered from dedup cache");
        Some(response)
    }

    /// Replay a whole batch, only if every item has a prior outcome.
    async fn replay_batch(
        &self,
        credential: &str,
        items: &[(BatchItem, String)],
    ) -> Option<Vec<Arc<ExecuteResponse>>> {
        let lookups = items
            .iter()
            .map(|(item, fingerprint)| {
                self.dedup
                    .lookup_token(credential, &item.request_id, fingerprint)
            })
            .collect::<Option<Vec<Lookup>>>()?;

        let mut responses = Vec::with_capacity(lookups.len());
        for lookup in lookups {
            responses.push(lookup.resolve().await?);
        }
        for _ in &responses {
            self.stats.record_dedup_hit();
        }
        debug!(items = responses.len(), "Batch answered from dedup cache");
        Some(responses)
    }

    fn reject(
        &self,
        guard: Option<DedupGuard>,
        request_id: &str,
        error: ErrorBody,
        started: Instant,
    ) -> Arc<ExecuteResponse> {
        debug!(request_id, kind = %error.kind, message = %error.message, "Request rejected");
        self.stats.record_rejection();
        let response = Arc::new(ExecuteResponse::failed(
            request_id,
            error,
            elapsed_timing(started),
        ));
        if let Some(guard) = guard {
            guard.complete(response.clone(), false);
        }
        response
    }

    /// Signal a running request to stop. Only the credential that started
    /// it can cancel it. Returns false if no such execution is running here.
    pub fn cancel(&self, credential: &str, request_id: &str) -> bool {
        let signal = self.cancels.lock().ok().and_then(|cancels| {
            cancels
                .get(&(credential.to_string(), request_id.to_string()))
                .cloned()
        });
        match signal {
            Some(signal) => {
                signal.cancel();
                info!(request_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Make a model resident. Called by the manager on the cold-start path.
    pub async fn load_model(&self, model: ModelVersion) -> Result<LoadModelResponse, ErrorBody> {
        if model.accelerator == Some(AcceleratorClass::Gpu)
            && self.config.capabilities.accelerator != AcceleratorClass::Gpu
        {
            return Err(ErrorBody::new(
                ErrorKind::BadRequest,
                format!("model {} requires a gpu worker", model.model_ref()),
            ));
        }

        let model_ref = model.model_ref();
        let store = self.store.clone();
        let outcome = tokio::task::spawn_blocking(move || store.load(model))
            .await
            .map_err(|e| ErrorBody::new(ErrorKind::Internal, format!("Task join error: {}", e)))??;

        Ok(LoadModelResponse {
            success: true,
            model: model_ref,
            already_loaded: outcome.already_loaded,
            evicted: outcome.evicted,
        })
    }

    pub fn unload_model(&self, model: &ModelRef) -> Result<bool, ErrorBody> {
        Ok(self.store.unload(model)?)
    }

    /// Heartbeat body describing this worker right now.
    pub fn heartbeat_request(&self, address: &str) -> HeartbeatRequest {
        HeartbeatRequest {
            worker_id: self.config.worker_id.clone(),
            address: address.to_string(),
            capabilities: self.config.capabilities.clone(),
            loaded_models: self.store.loaded().unwrap_or_default(),
            active_sessions: self.in_flight(),
        }
    }

    /// Idle model unload and dedup expiry.
    pub fn maintenance(&self) {
        if let Some(idle) = self.config.idle_unload {
            if let Err(e) = self.store.unload_idle(idle) {
                warn!(error = %e, "Idle model sweep failed");
            }
        }
        let purged = self.dedup.purge_expired();
        if purged > 0 {
            debug!(purged, "Expired dedup entries purged");
        }
    }

    pub async fn maintenance_loop(self: Arc<Self>, period: Duration) {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.maintenance();
        }
    }
}

fn deadline_exceeded(deadline: Duration) -> ErrorBody {
    ErrorBody::new(
        ErrorKind::DeadlineExceeded,
        format!("deadline of {}ms exceeded", deadline.as_millis()),
    )
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn elapsed_timing(started: Instant) -> Timing {
    Timing {
        queue_ms: elapsed_ms(started),
        execution_ms: 0,
    }
}

/// Everything a detached execution owns.
struct Execution {
    request_id: String,
    model: ModelRef,
    resident: ResidentModel,
    inputs: NamedTensors,
    cancel: CancelSignal,
    cancel_key: (String, String),
    started: Instant,
    store: Arc<ModelStore>,
    stats: Arc<WorkerStats>,
    cancels: CancelMap,
}

impl Execution {
    async fn run(self, guard: DedupGuard, permit: OwnedSemaphorePermit) -> Arc<ExecuteResponse> {
        let queue_ms = self.started.elapsed().as_millis() as u64;
        let exec_start = Instant::now();

        let handle = self.resident.handle.clone();
        let inputs = self.inputs;
        let cancel = self.cancel.clone();
        let result = tokio::task::spawn_blocking(move || handle.run(&inputs, &cancel)).await;

        let execution = exec_start.elapsed();
        drop(permit);
        if let Ok(mut cancels) = self.cancels.lock() {
            // A later execution may have reused the key; leave its signal alone.
            if cancels
                .get(&self.cancel_key)
                .is_some_and(|signal| signal.same_as(&self.cancel))
            {
                cancels.remove(&self.cancel_key);
            }
        }

        let timing = Timing {
            queue_ms,
            execution_ms: execution.as_millis() as u64,
        };
        let failure = |message: String| ErrorBody::new(ErrorKind::ExecutionError, message);

        let (outcome, cache) = match result {
            Ok(Ok(outputs)) => match validate_tensors(&self.resident.version.schema.outputs, &outputs) {
                Ok(()) => (Ok(outputs), true),
                Err(violation) => (
                    Err(failure(format!("executor produced invalid outputs: {}", violation))),
                    true,
                ),
            },
            Ok(Err(ExecutorError::Cancelled)) => (Err(failure("execution cancelled".into())), false),
            Ok(Err(e)) => (Err(failure(e.to_string())), true),
            Err(e) if e.is_panic() => (Err(failure("executor panicked".into())), true),
            Err(e) => (
                Err(ErrorBody::new(ErrorKind::Internal, format!("Task join error: {}", e))),
                false,
            ),
        };

        self.store.record_execution(&self.model, execution);
        let response = match outcome {
            Ok(outputs) => {
                self.stats.record_success(timing.execution_ms);
                debug!(
                    request_id = %self.request_id,
                    model = %self.model,
                    execution_ms = timing.execution_ms,
                    "Execution completed"
                );
                ExecuteResponse::ok(self.request_id, outputs, timing)
            }
            Err(error) => {
                self.stats.record_failure(timing.execution_ms);
                warn!(
                    request_id = %self.request_id,
                    model = %self.model,
                    error = %error,
                    "Execution failed"
                );
                ExecuteResponse::failed(self.request_id, error, timing)
            }
        };

        let response = Arc::new(response);
        guard.complete(response.clone(), cache);
        response
    }
}
