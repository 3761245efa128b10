//! Test fixtures: a runtime wired to an in-process session authority.

use crate::executor::{CancelSignal, ExecutorResult, LoadedModel, ModelExecutor, ReferenceExecutor};
use crate::runtime::{RuntimeConfig, SessionValidator, WorkerRuntime};
use async_trait::async_trait;
use control_plane::api::error::ApiError;
use control_plane::config::{SessionsConfig, WorkersConfig};
use control_plane::services::{SessionAuthority, WorkerDirectory};
use infermesh_common::wire::{HeartbeatRequest, SessionGrant};
use infermesh_common::{
    ElementType, ErrorBody, ModelArtifact, ModelRef, ModelSchema, ModelVersion, NamedTensors,
    Stage, Tensor, TensorSpec, WorkerCapabilities,
};
use std::sync::Arc;
use std::time::Duration;

pub const WORKER_ID: &str = "worker-1";

/// `y = 2x + 1` over a `[batch, 5]` f32 tensor named `input`.
pub fn linear(version: &str) -> ModelVersion {
    ModelVersion {
        model_id: "linear".into(),
        version: version.into(),
        stage: Stage::Prod,
        schema: ModelSchema {
            inputs: vec![TensorSpec::new("input", ElementType::F32, vec![None, Some(5)])],
            outputs: vec![TensorSpec::new("output", ElementType::F32, vec![None, Some(5)])],
        },
        artifact: ModelArtifact::Affine {
            scale: 2.0,
            bias: 1.0,
        },
        tags: Vec::new(),
        description: String::new(),
        accelerator: None,
        publish_seq: 1,
        published_at: None,
    }
}

/// A single `[1, n]` f32 input named `input`.
pub fn input(values: Vec<f32>) -> NamedTensors {
    let mut inputs = NamedTensors::new();
    let len = values.len() as u64;
    inputs.insert("input".into(), Tensor::f32(vec![1, len], values).unwrap());
    inputs
}

/// Echoes `input` back as `output` after `delay`, checking for
/// cancellation every few milliseconds.
pub struct SlowExecutor {
    delay: Duration,
}

impl SlowExecutor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ModelExecutor for SlowExecutor {
    fn load(&self, _: &ModelVersion) -> ExecutorResult<Arc<dyn LoadedModel>> {
        Ok(Arc::new(SlowModel { delay: self.delay }))
    }
}

struct SlowModel {
    delay: Duration,
}

impl LoadedModel for SlowModel {
    fn run(&self, inputs: &NamedTensors, cancel: &CancelSignal) -> ExecutorResult<NamedTensors> {
        let started = std::time::Instant::now();
        while started.elapsed() < self.delay {
            cancel.check()?;
            std::thread::sleep(Duration::from_millis(5));
        }
        cancel.check()?;
        let mut outputs = NamedTensors::new();
        if let Some(tensor) = inputs.get("input") {
            outputs.insert("output".into(), tensor.clone());
        }
        Ok(outputs)
    }
}

pub struct AuthorityValidator(pub Arc<SessionAuthority>);

#[async_trait]
impl SessionValidator for AuthorityValidator {
    async fn validate(&self, credential: &str, worker_id: &str) -> Result<SessionGrant, ErrorBody> {
        self.0.validate(credential, worker_id).map_err(|e| {
            let e = ApiError::from(e);
            ErrorBody::new(e.kind(), e.to_string())
        })
    }
}

pub struct AuthorityHarness {
    pub runtime: Arc<WorkerRuntime>,
    pub directory: Arc<WorkerDirectory>,
    pub authority: Arc<SessionAuthority>,
}

impl AuthorityHarness {
    pub fn new(capacity: u32) -> Self {
        Self::build(capacity, SessionsConfig::default(), Arc::new(ReferenceExecutor::new()))
    }

    pub fn with_ttl(capacity: u32, ttl: Duration) -> Self {
        let sessions = SessionsConfig {
            ttl_ms: ttl.as_millis() as u64,
            ..SessionsConfig::default()
        };
        Self::build(capacity, sessions, Arc::new(ReferenceExecutor::new()))
    }

    pub fn with_executor(capacity: u32, executor: Arc<dyn ModelExecutor>) -> Self {
        Self::build(capacity, SessionsConfig::default(), executor)
    }

    fn build(capacity: u32, sessions: SessionsConfig, executor: Arc<dyn ModelExecutor>) -> Self {
        let directory = Arc::new(WorkerDirectory::new(WorkersConfig::default()));
        let authority = Arc::new(SessionAuthority::new(directory.clone(), sessions));

        // The directory side is sized generously so tests can mint many credentials.
        directory
            .register_or_update(HeartbeatRequest {
                worker_id: WORKER_ID.into(),
                address: "http://worker-1.local:9000".into(),
                capabilities: WorkerCapabilities::cpu(64),
                loaded_models: Vec::new(),
                active_sessions: 0,
            })
            .unwrap();

        let config = RuntimeConfig {
            worker_id: WORKER_ID.into(),
            capabilities: WorkerCapabilities::cpu(capacity),
            default_deadline: Duration::from_secs(30),
            max_resident_models: 4,
            idle_unload: None,
            dedup_capacity: 128,
            dedup_ttl: Duration::from_secs(300),
        };
        let runtime = Arc::new(WorkerRuntime::new(
            config,
            executor,
            Arc::new(AuthorityValidator(authority.clone())),
        ));

        Self {
            runtime,
            directory,
            authority,
        }
    }
}

pub fn authority_runtime(capacity: u32) -> AuthorityHarness {
    AuthorityHarness::new(capacity)
}

/// Mint a credential for `model_id:version` on the test worker.
pub fn issue(harness: &AuthorityHarness, model_id: &str, version: &str) -> String {
    issue_for(harness, model_id, version, "test-client")
}

pub fn issue_for(harness: &AuthorityHarness, model_id: &str, version: &str, client: &str) -> String {
    let reservation = harness.directory.try_reserve(WORKER_ID).unwrap().unwrap();
    harness
        .authority
        .issue(reservation, ModelRef::new(model_id, version), client, None)
        .unwrap()
        .token
}
