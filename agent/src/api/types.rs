use crate::model::ModelStats;
use crate::runtime::StatsSnapshot;
use infermesh_common::{AcceleratorClass, ModelRef, ModelSchema, Stage, WorkerCapabilities};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedModelsResponse {
    pub success: bool,
    pub models: Vec<ModelRef>,
}

/// Only the credential that started a request may cancel it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub success: bool,
    /// False when the request is not running on this worker.
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfoResponse {
    pub success: bool,
    pub model: ModelRef,
    pub stage: Stage,
    pub schema: ModelSchema,
    pub description: String,
    pub tags: Vec<String>,
    pub accelerator: Option<AcceleratorClass>,
    pub stats: ModelStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub success: bool,
    pub worker_id: String,
    pub capabilities: WorkerCapabilities,
    pub in_flight: u32,
    pub dedup_entries: usize,
    pub stats: StatsSnapshot,
    pub models: Vec<ModelStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub worker_id: String,
    pub loaded_models: usize,
    pub in_flight: u32,
}
