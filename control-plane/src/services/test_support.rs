//! Fixtures shared by the service tests.

use infermesh_common::wire::HeartbeatRequest;
use infermesh_common::{
    ElementType, ModelArtifact, ModelRef, ModelSchema, ModelVersion, Stage, TensorSpec,
    WorkerCapabilities,
};

/// `y = 2x + 1` over a `[batch, 5]` f32 tensor named `input`.
pub fn linear(version: &str, stage: Stage) -> ModelVersion {
    ModelVersion {
        model_id: "linear".into(),
        version: version.into(),
        stage,
        schema: ModelSchema {
            inputs: vec![TensorSpec::new("input", ElementType::F32, vec![None, Some(5)])],
            outputs: vec![TensorSpec::new("output", ElementType::F32, vec![None, Some(5)])],
        },
        artifact: ModelArtifact::Affine {
            scale: 2.0,
            bias: 1.0,
        },
        tags: vec!["regression".into()],
        description: "y = 2x + 1".into(),
        accelerator: None,
        publish_seq: 0,
        published_at: None,
    }
}

pub fn heartbeat(worker_id: &str, capacity: u32, active: u32, models: &[ModelRef]) -> HeartbeatRequest {
    HeartbeatRequest {
        worker_id: worker_id.into(),
        address: format!("http://{}.local:9000", worker_id),
        capabilities: WorkerCapabilities::cpu(capacity),
        loaded_models: models.to_vec(),
        active_sessions: active,
    }
}
