//! Handler test fixtures: an in-memory manager with a placement that always loads.

use crate::config::ManagerConfig;
use crate::db::Database;
use crate::services::directory::WorkerRecord;
use crate::services::{ModelPlacement, PlacementError};
use crate::state::AppState;
use async_trait::async_trait;
use infermesh_common::wire::LoadModelResponse;
use infermesh_common::ModelVersion;
use std::sync::Arc;

pub use crate::services::test_support::heartbeat as heartbeat_request;

pub struct AlwaysLoads;

#[async_trait]
impl ModelPlacement for AlwaysLoads {
    async fn load_model(
        &self,
        _worker: &WorkerRecord,
        model: &ModelVersion,
    ) -> Result<LoadModelResponse, PlacementError> {
        Ok(LoadModelResponse {
            success: true,
            model: model.model_ref(),
            already_loaded: false,
            evicted: Vec::new(),
        })
    }
}

pub fn test_state() -> AppState {
    test_state_with(|_| {})
}

pub fn test_state_with(configure: impl FnOnce(&mut ManagerConfig)) -> AppState {
    let mut config = ManagerConfig::default();
    configure(&mut config);
    let db = Database::open_in_memory().expect("in-memory database");
    AppState::new(config, db, Arc::new(AlwaysLoads)).expect("app state")
}
