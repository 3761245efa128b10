pub mod error;
pub mod routes;
pub mod types;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::runtime::WorkerRuntime;

/// Create the worker API router
pub fn create_router(runtime: Arc<WorkerRuntime>) -> Router {
    Router::new()
        .route("/health", get(routes::health_check))
        // Client-facing
        .route("/api/v1/execute", post(routes::execute))
        .route("/api/v1/execute/batch", post(routes::execute_batch))
        .route("/api/v1/requests/:request_id/cancel", post(routes::cancel_request))
        // Manager-facing
        .route("/api/v1/models", get(routes::list_models))
        .route("/api/v1/models/load", post(routes::load_model))
        .route("/api/v1/models/unload", post(routes::unload_model))
        .route("/api/v1/models/:model_id/:version", get(routes::model_info))
        .route("/api/v1/stats", get(routes::stats))
        .with_state(runtime)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
