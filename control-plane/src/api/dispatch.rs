use axum::{extract::State, http::HeaderMap, Json};
use std::time::Duration;
use tracing::instrument;

use crate::api::auth::authorize;
use crate::api::error::ApiResult;
use crate::services::api_keys::Permission;
use crate::state::AppState;
use infermesh_common::wire::{AssignRequest, AssignResponse};

/// AssignWorker: pick a worker for the model and mint a credential for it.
#[instrument(skip(state, headers, req), fields(model_id = %req.model_id, version = %req.version))]
pub async fn assign_worker(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AssignRequest>,
) -> ApiResult<Json<AssignResponse>> {
    let client = authorize(&state, &headers, Permission::Inference)?;

    let assignment = state
        .dispatcher
        .assign(
            &req.model_id,
            &req.version,
            &client,
            req.stage_filter,
            req.deadline_ms.map(Duration::from_millis),
        )
        .await?;

    let credential = assignment.credential;
    Ok(Json(AssignResponse {
        success: true,
        worker_id: assignment.worker_id,
        worker_address: assignment.worker_address,
        expires_at: credential.expires_at,
        expires_in_ms: credential.ttl.as_millis() as u64,
        credential: credential.token,
        cold_start: assignment.cold_start,
        model: assignment.model.model_ref(),
        schema: assignment.model.schema.clone(),
    }))
}
