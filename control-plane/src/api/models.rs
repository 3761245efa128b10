use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use tracing::{info, instrument};

use crate::api::auth::authorize;
use crate::api::error::ApiResult;
use crate::api::types::{ListModelsQuery, ModelResponse, PublishModelRequest, SetStageRequest};
use crate::services::api_keys::Permission;
use crate::state::AppState;
use infermesh_common::wire::ListModelsResponse;
use infermesh_common::{ModelRef, ModelVersion};

#[instrument(skip(state, headers))]
pub async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListModelsQuery>,
) -> ApiResult<Json<ListModelsResponse>> {
    authorize(&state, &headers, Permission::Inference)?;

    let models = state.registry.list(query.stage, query.tag.as_deref())?;
    Ok(Json(ListModelsResponse {
        success: true,
        models,
    }))
}

#[instrument(skip(state, headers))]
pub async fn get_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((model_id, version)): Path<(String, String)>,
) -> ApiResult<Json<ModelResponse>> {
    authorize(&state, &headers, Permission::Inference)?;

    let model = state.registry.get(&ModelRef::new(model_id, version))?;
    Ok(Json(ModelResponse {
        success: true,
        model: model.summary(),
    }))
}

#[instrument(skip(state, headers, req), fields(model_id = %req.model_id, version = %req.version))]
pub async fn publish_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PublishModelRequest>,
) -> ApiResult<Json<ModelResponse>> {
    let publisher = authorize(&state, &headers, Permission::ModelPublish)?;
    let model = ModelVersion::from(req);

    let published = state
        .blocking(move |state| Ok(state.registry.publish(model)?))
        .await?;

    info!(
        model = %published.model_ref(),
        stage = %published.stage,
        publisher = %publisher.name,
        "Model published"
    );

    Ok(Json(ModelResponse {
        success: true,
        model: published.summary(),
    }))
}

#[instrument(skip(state, headers))]
pub async fn set_stage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((model_id, version)): Path<(String, String)>,
    Json(req): Json<SetStageRequest>,
) -> ApiResult<Json<ModelResponse>> {
    authorize(&state, &headers, Permission::ModelPublish)?;
    let model = ModelRef::new(model_id, version);

    let updated = state
        .blocking(move |state| Ok(state.registry.set_stage(&model, req.stage)?))
        .await?;

    Ok(Json(ModelResponse {
        success: true,
        model: updated.summary(),
    }))
}

/// Remove a version from the catalog. Refused while sessions for it are live.
#[instrument(skip(state, headers))]
pub async fn retire_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((model_id, version)): Path<(String, String)>,
) -> ApiResult<Json<ModelResponse>> {
    authorize(&state, &headers, Permission::ModelRetire)?;
    let model = ModelRef::new(model_id, version);

    let retired = state
        .blocking(move |state| Ok(state.dispatcher.retire(&model)?))
        .await?;

    Ok(Json(ModelResponse {
        success: true,
        model: retired.summary(),
    }))
}
