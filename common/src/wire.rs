//! Request and response bodies exchanged between clients, the manager and workers.

use crate::error::ErrorBody;
use crate::model::{ModelRef, ModelSchema, ModelSummary, ModelVersion, Stage, VersionSelector};
use crate::tensor::NamedTensors;
use crate::worker::{WorkerCapabilities, WorkerStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

// ---------------------------------------------------------------------------
// Client -> manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRequest {
    pub model_id: String,
    #[serde(default)]
    pub version: VersionSelector,
    /// Minimum stage the caller accepts. Defaults to prod.
    #[serde(default)]
    pub stage_filter: Option<Stage>,
    /// Deadline for the assignment call itself.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignResponse {
    pub success: bool,
    pub worker_id: String,
    pub worker_address: String,
    pub credential: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub expires_in_ms: u64,
    /// True when the worker had to load the model for this assignment.
    pub cold_start: bool,
    pub model: ModelRef,
    pub schema: ModelSchema,
}

// ---------------------------------------------------------------------------
// Client -> worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub credential: String,
    /// Client-assigned id; retries with the same id are answered from the dedup cache.
    pub request_id: String,
    pub inputs: NamedTensors,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub queue_ms: u64,
    pub execution_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default)]
    pub outputs: NamedTensors,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ExecuteResponse {
    pub fn ok(request_id: impl Into<String>, outputs: NamedTensors, timing: Timing) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            outputs,
            timing,
            error: None,
        }
    }

    pub fn failed(request_id: impl Into<String>, error: ErrorBody, timing: Timing) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            outputs: NamedTensors::new(),
            timing,
            error: Some(error),
        }
    }
}

/// One input set in a batch; deduplicated like a single execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub request_id: String,
    pub inputs: NamedTensors,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchExecuteRequest {
    pub credential: String,
    pub items: Vec<BatchItem>,
    /// Deadline for the whole batch.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchExecuteResponse {
    /// True when every item succeeded.
    pub success: bool,
    /// Per-item outcomes, in request order.
    #[serde(default)]
    pub responses: Vec<ExecuteResponse>,
    pub total_ms: u64,
    /// Set when the batch as a whole was refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl BatchExecuteResponse {
    pub fn collect<R: AsRef<ExecuteResponse>>(responses: Vec<R>, total_ms: u64) -> Self {
        let responses: Vec<ExecuteResponse> =
            responses.iter().map(|r| r.as_ref().clone()).collect();
        Self {
            success: responses.iter().all(|r| r.success),
            responses,
            total_ms,
            error: None,
        }
    }

    pub fn failed(error: ErrorBody, total_ms: u64) -> Self {
        Self {
            success: false,
            responses: Vec::new(),
            total_ms,
            error: Some(error),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker -> manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: String,
    /// Base URL clients use to reach the worker.
    pub address: String,
    pub capabilities: WorkerCapabilities,
    #[serde(default)]
    pub loaded_models: Vec<ModelRef>,
    #[serde(default)]
    pub active_sessions: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    /// True when this heartbeat created the directory entry.
    pub registered: bool,
    pub heartbeat_interval_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub server_time: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateSessionRequest {
    pub credential: String,
    pub worker_id: String,
}

/// What a validated credential entitles its bearer to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionGrant {
    pub worker_id: String,
    pub model: ModelRef,
    /// Identity of the client the credential was issued to.
    pub client: String,
    pub expires_in_ms: u64,
    /// Calls left after this one, when the credential is use-limited.
    pub remaining_calls: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateSessionResponse {
    pub success: bool,
    pub grant: SessionGrant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSessionResponse {
    pub success: bool,
    /// False when the credential was unknown or already gone.
    pub closed: bool,
}

// ---------------------------------------------------------------------------
// Manager -> worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadModelRequest {
    pub model: ModelVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadModelResponse {
    pub success: bool,
    pub model: ModelRef,
    /// True when the model was already resident.
    pub already_loaded: bool,
    /// Models evicted to make room.
    #[serde(default)]
    pub evicted: Vec<ModelRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnloadModelRequest {
    pub model: ModelRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnloadModelResponse {
    pub success: bool,
    pub unloaded: bool,
}

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub address: String,
    pub capabilities: WorkerCapabilities,
    pub loaded_models: Vec<ModelRef>,
    pub active_sessions: u32,
    pub status: WorkerStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_heartbeat: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListWorkersResponse {
    pub success: bool,
    pub workers: Vec<WorkerSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListModelsResponse {
    pub success: bool,
    pub models: Vec<ModelSummary>,
}
