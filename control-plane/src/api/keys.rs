use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use tracing::instrument;

use crate::api::auth::authorize;
use crate::api::error::ApiResult;
use crate::api::types::{CreateKeyResponse, ListKeysResponse, SuccessResponse};
use crate::services::api_keys::{NewApiKey, Permission};
use crate::state::AppState;

#[instrument(skip(state, headers, req), fields(name = %req.name))]
pub async fn create_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<NewApiKey>,
) -> ApiResult<Json<CreateKeyResponse>> {
    authorize(&state, &headers, Permission::Admin)?;

    let (api_key, key) = state
        .blocking(move |state| Ok(state.api_keys.create(req)?))
        .await?;

    Ok(Json(CreateKeyResponse {
        success: true,
        api_key,
        key,
    }))
}

#[instrument(skip(state, headers))]
pub async fn list_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<ListKeysResponse>> {
    authorize(&state, &headers, Permission::Admin)?;

    Ok(Json(ListKeysResponse {
        success: true,
        keys: state.api_keys.list()?,
    }))
}

#[instrument(skip(state, headers))]
pub async fn revoke_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> ApiResult<Json<SuccessResponse>> {
    authorize(&state, &headers, Permission::Admin)?;

    state
        .blocking(move |state| Ok(state.api_keys.revoke(&key_id)?))
        .await?;

    Ok(Json(SuccessResponse { success: true }))
}
