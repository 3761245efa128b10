use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};

use crate::api::auth::authorize;
use crate::api::error::ApiResult;
use crate::api::types::{HealthResponse, UnregisterWorkerResponse};
use crate::services::api_keys::Permission;
use crate::state::AppState;
use infermesh_common::wire::{
    CloseSessionRequest, CloseSessionResponse, HeartbeatRequest, HeartbeatResponse,
    ListWorkersResponse, ValidateSessionRequest, ValidateSessionResponse,
};
use time::OffsetDateTime;
use tracing::instrument;

/// Health check endpoint
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        workers: state.directory.list()?.len(),
        active_sessions: state.authority.active_count()?,
    }))
}

/// Worker heartbeat; the first one registers the worker.
#[instrument(skip(state, headers, req), fields(worker_id = %req.worker_id))]
pub async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    authorize(&state, &headers, Permission::WorkerRegister)?;

    let registered = state.directory.register_or_update(req)?;

    Ok(Json(HeartbeatResponse {
        success: true,
        registered,
        heartbeat_interval_ms: state.config.workers.heartbeat_interval_ms,
        server_time: OffsetDateTime::now_utc(),
    }))
}

#[instrument(skip(state))]
pub async fn list_workers(State(state): State<AppState>) -> ApiResult<Json<ListWorkersResponse>> {
    Ok(Json(ListWorkersResponse {
        success: true,
        workers: state.directory.list()?,
    }))
}

#[instrument(skip(state, headers))]
pub async fn unregister_worker(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(worker_id): Path<String>,
) -> ApiResult<Json<UnregisterWorkerResponse>> {
    authorize(&state, &headers, Permission::WorkerRegister)?;

    let record = state.directory.unregister(&worker_id)?;

    Ok(Json(UnregisterWorkerResponse {
        success: true,
        worker_id: record.worker_id,
    }))
}

/// Called by a worker for every credential presented to it.
#[instrument(skip(state, headers, req), fields(worker_id = %req.worker_id))]
pub async fn validate_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ValidateSessionRequest>,
) -> ApiResult<Json<ValidateSessionResponse>> {
    authorize(&state, &headers, Permission::WorkerRegister)?;

    let grant = state.authority.validate(&req.credential, &req.worker_id)?;

    Ok(Json(ValidateSessionResponse {
        success: true,
        grant,
    }))
}

/// Release a credential early. The credential itself is the authorization.
#[instrument(skip(state, req))]
pub async fn close_session(
    State(state): State<AppState>,
    Json(req): Json<CloseSessionRequest>,
) -> ApiResult<Json<CloseSessionResponse>> {
    let closed = state.authority.close(&req.credential)?;

    Ok(Json(CloseSessionResponse {
        success: true,
        closed,
    }))
}
