pub mod auth;
pub mod dispatch;
pub mod error;
pub mod keys;
pub mod models;
pub mod routes;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check endpoint
        .route("/health", get(routes::health_check))
        // Client entry point
        .route("/api/v1/assign", post(dispatch::assign_worker))
        // Session endpoints
        .route("/api/v1/sessions/validate", post(routes::validate_session))
        .route("/api/v1/sessions/close", post(routes::close_session))
        // Worker membership
        .route("/api/v1/workers", get(routes::list_workers))
        .route("/api/v1/workers/heartbeat", post(routes::heartbeat))
        .route("/api/v1/workers/:id", delete(routes::unregister_worker))
        // Model catalog
        .route(
            "/api/v1/models",
            get(models::list_models).post(models::publish_model),
        )
        .route(
            "/api/v1/models/:id/:version",
            get(models::get_model).delete(models::retire_model),
        )
        .route("/api/v1/models/:id/:version/stage", put(models::set_stage))
        // API keys
        .route("/api/v1/keys", get(keys::list_keys).post(keys::create_key))
        .route("/api/v1/keys/:key_id", delete(keys::revoke_key))
        // Attach application state
        .with_state(state)
        // Middleware
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
