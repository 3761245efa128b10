use crate::services::api_keys::ApiKeyInfo;
use infermesh_common::{
    AcceleratorClass, ModelArtifact, ModelSchema, ModelSummary, ModelVersion, Stage,
};
use serde::{Deserialize, Serialize};

/// Publish request body. The registry assigns sequence and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishModelRequest {
    pub model_id: String,
    pub version: String,
    #[serde(default = "default_stage")]
    pub stage: Stage,
    pub schema: ModelSchema,
    pub artifact: ModelArtifact,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub accelerator: Option<AcceleratorClass>,
}

fn default_stage() -> Stage {
    Stage::Dev
}

impl From<PublishModelRequest> for ModelVersion {
    fn from(req: PublishModelRequest) -> Self {
        ModelVersion {
            model_id: req.model_id,
            version: req.version,
            stage: req.stage,
            schema: req.schema,
            artifact: req.artifact,
            tags: req.tags,
            description: req.description,
            accelerator: req.accelerator,
            publish_seq: 0,
            published_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub success: bool,
    pub model: ModelSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStageRequest {
    pub stage: Stage,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListModelsQuery {
    pub stage: Option<Stage>,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterWorkerResponse {
    pub success: bool,
    pub worker_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateKeyResponse {
    pub success: bool,
    /// Plaintext key. Only ever returned here.
    pub api_key: String,
    pub key: ApiKeyInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListKeysResponse {
    pub success: bool,
    pub keys: Vec<ApiKeyInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub workers: usize,
    pub active_sessions: usize,
}
