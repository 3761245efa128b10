use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::instrument;

use crate::api::error::ApiResult;
use crate::api::types::{
    CancelRequest, CancelResponse, HealthResponse, LoadedModelsResponse, ModelInfoResponse,
    StatsResponse,
};
use crate::runtime::WorkerRuntime;
use infermesh_common::wire::{
    BatchExecuteRequest, BatchExecuteResponse, ExecuteRequest, ExecuteResponse, LoadModelRequest,
    LoadModelResponse, UnloadModelRequest, UnloadModelResponse,
};
use infermesh_common::{ErrorBody, ModelRef};

/// Health check endpoint
#[instrument(skip(runtime))]
pub async fn health_check(
    State(runtime): State<Arc<WorkerRuntime>>,
) -> ApiResult<Json<HealthResponse>> {
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        worker_id: runtime.worker_id().to_string(),
        loaded_models: runtime.loaded_models()?.len(),
        in_flight: runtime.in_flight(),
    }))
}

/// Execute a credentialed request. Failures keep the `ExecuteResponse`
/// shape; the status code follows the error kind.
#[instrument(skip(runtime, req), fields(request_id = %req.request_id))]
pub async fn execute(
    State(runtime): State<Arc<WorkerRuntime>>,
    Json(req): Json<ExecuteRequest>,
) -> (StatusCode, Json<ExecuteResponse>) {
    let response = runtime.execute(req).await;
    (status_of(response.error.as_ref()), Json(ExecuteResponse::clone(&response)))
}

/// Execute several input sets under one credential. Item failures are
/// reported per item with 200; only a refused batch changes the status.
#[instrument(skip(runtime, req), fields(items = req.items.len()))]
pub async fn execute_batch(
    State(runtime): State<Arc<WorkerRuntime>>,
    Json(req): Json<BatchExecuteRequest>,
) -> (StatusCode, Json<BatchExecuteResponse>) {
    let response = runtime.execute_batch(req).await;
    (status_of(response.error.as_ref()), Json(response))
}

fn status_of(error: Option<&ErrorBody>) -> StatusCode {
    error
        .and_then(|e| StatusCode::from_u16(e.kind.http_status()).ok())
        .unwrap_or(StatusCode::OK)
}

#[instrument(skip(runtime, req), fields(model = %req.model.model_ref()))]
pub async fn load_model(
    State(runtime): State<Arc<WorkerRuntime>>,
    Json(req): Json<LoadModelRequest>,
) -> ApiResult<Json<LoadModelResponse>> {
    Ok(Json(runtime.load_model(req.model).await?))
}

#[instrument(skip(runtime, req), fields(model = %req.model))]
pub async fn unload_model(
    State(runtime): State<Arc<WorkerRuntime>>,
    Json(req): Json<UnloadModelRequest>,
) -> ApiResult<Json<UnloadModelResponse>> {
    let unloaded = runtime.unload_model(&req.model)?;
    Ok(Json(UnloadModelResponse {
        success: true,
        unloaded,
    }))
}

#[instrument(skip(runtime))]
pub async fn list_models(
    State(runtime): State<Arc<WorkerRuntime>>,
) -> ApiResult<Json<LoadedModelsResponse>> {
    Ok(Json(LoadedModelsResponse {
        success: true,
        models: runtime.loaded_models()?,
    }))
}

#[instrument(skip(runtime))]
pub async fn model_info(
    State(runtime): State<Arc<WorkerRuntime>>,
    Path((model_id, version)): Path<(String, String)>,
) -> ApiResult<Json<ModelInfoResponse>> {
    let (model, stats) = runtime.model_info(&ModelRef::new(model_id, version))?;
    Ok(Json(ModelInfoResponse {
        success: true,
        model: model.model_ref(),
        stage: model.stage,
        schema: model.schema.clone(),
        description: model.description.clone(),
        tags: model.tags.clone(),
        accelerator: model.accelerator,
        stats,
    }))
}

#[instrument(skip(runtime, req))]
pub async fn cancel_request(
    State(runtime): State<Arc<WorkerRuntime>>,
    Path(request_id): Path<String>,
    Json(req): Json<CancelRequest>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        success: true,
        cancelled: runtime.cancel(&req.credential, &request_id),
    })
}

#[instrument(skip(runtime))]
pub async fn stats(State(runtime): State<Arc<WorkerRuntime>>) -> ApiResult<Json<StatsResponse>> {
    Ok(Json(StatsResponse {
        success: true,
        worker_id: runtime.worker_id().to_string(),
        capabilities: runtime.capabilities().clone(),
        in_flight: runtime.in_flight(),
        dedup_entries: runtime.dedup_entries(),
        stats: runtime.stats(),
        models: runtime.model_stats()?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{authority_runtime, input, issue, linear};
    use infermesh_common::wire::BatchItem;
    use infermesh_common::ErrorKind;

    #[tokio::test]
    async fn test_load_list_unload() {
        let harness = authority_runtime(2);
        let runtime = harness.runtime.clone();

        let loaded = load_model(
            State(runtime.clone()),
            Json(LoadModelRequest {
                model: linear("v1"),
            }),
        )
        .await
        .unwrap()
        .0;
        assert!(!loaded.already_loaded);

        let listed = list_models(State(runtime.clone())).await.unwrap().0;
        assert_eq!(listed.models, vec![ModelRef::new("linear", "v1")]);

        let unloaded = unload_model(
            State(runtime.clone()),
            Json(UnloadModelRequest {
                model: ModelRef::new("linear", "v1"),
            }),
        )
        .await
        .unwrap()
        .0;
        assert!(unloaded.unloaded);

        let health = health_check(State(runtime)).await.unwrap().0;
        assert_eq!(health.loaded_models, 0);
    }

    #[tokio::test]
    async fn test_execute_status_codes() {
        let harness = authority_runtime(2);
        let runtime = harness.runtime.clone();
        runtime.load_model(linear("v1")).await.unwrap();

        let token = issue(&harness, "linear", "v1");
        let (status, body) = execute(
            State(runtime.clone()),
            Json(ExecuteRequest {
                credential: token,
                request_id: "r1".into(),
                inputs: input(vec![1.0; 5]),
                deadline_ms: None,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.success);

        let (status, body) = execute(
            State(runtime.clone()),
            Json(ExecuteRequest {
                credential: "sess_missing".into(),
                request_id: "r2".into(),
                inputs: input(vec![1.0; 5]),
                deadline_ms: None,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.error.as_ref().unwrap().kind, ErrorKind::InvalidSession);

        let stats = stats(State(runtime)).await.unwrap().0;
        assert_eq!(stats.stats.completed, 1);
        assert_eq!(stats.stats.rejected, 1);
        assert_eq!(stats.models[0].inference_count, 1);
    }

    #[tokio::test]
    async fn test_cancel_unknown_request() {
        let harness = authority_runtime(1);
        let resp = cancel_request(
            State(harness.runtime.clone()),
            Path("r9".into()),
            Json(CancelRequest {
                credential: "sess_any".into(),
            }),
        )
        .await
        .0;
        assert!(!resp.cancelled);
    }

    #[tokio::test]
    async fn test_execute_batch_status_codes() {
        let harness = authority_runtime(2);
        let runtime = harness.runtime.clone();
        runtime.load_model(linear("v1")).await.unwrap();

        let token = issue(&harness, "linear", "v1");
        let (status, body) = execute_batch(
            State(runtime.clone()),
            Json(BatchExecuteRequest {
                credential: token,
                items: vec![
                    BatchItem {
                        request_id: "b1".into(),
                        inputs: input(vec![1.0; 5]),
                    },
                    BatchItem {
                        request_id: "b2".into(),
                        inputs: input(vec![1.0; 2]),
                    },
                ],
                deadline_ms: None,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.success);
        assert!(body.responses[0].success);
        assert_eq!(
            body.responses[1].error.as_ref().unwrap().kind,
            ErrorKind::SchemaMismatch
        );

        let (status, body) = execute_batch(
            State(runtime),
            Json(BatchExecuteRequest {
                credential: "sess_missing".into(),
                items: vec![BatchItem {
                    request_id: "b3".into(),
                    inputs: input(vec![1.0; 5]),
                }],
                deadline_ms: None,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.responses.is_empty());
    }

    #[tokio::test]
    async fn test_model_info() {
        let harness = authority_runtime(1);
        let runtime = harness.runtime.clone();
        runtime.load_model(linear("v1")).await.unwrap();

        let info = model_info(State(runtime.clone()), Path(("linear".into(), "v1".into())))
            .await
            .unwrap()
            .0;
        assert_eq!(info.model, ModelRef::new("linear", "v1"));
        assert_eq!(info.schema.outputs[0].name, "output");

        let err = model_info(State(runtime), Path(("linear".into(), "v2".into())))
            .await
            .unwrap_err();
        assert_eq!(err.0.kind, ErrorKind::NotFound);
    }
}
