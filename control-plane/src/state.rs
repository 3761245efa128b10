use crate::api::error::{ApiError, ApiResult};
use crate::config::ManagerConfig;
use crate::db::Database;
use crate::services::{
    ApiKeyManager, Dispatcher, ModelPlacement, ModelRegistry, SessionAuthority, WorkerDirectory,
};
use std::sync::Arc;

/// Axum application state shared across all request handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ManagerConfig>,
    /// Database connection pool
    pub db: Database,
    pub registry: Arc<ModelRegistry>,
    pub directory: Arc<WorkerDirectory>,
    pub authority: Arc<SessionAuthority>,
    pub dispatcher: Arc<Dispatcher>,
    pub api_keys: Arc<ApiKeyManager>,
}

impl AppState {
    /// Build the manager's stores, loading the catalog and keys from `db`.
    pub fn new(
        config: ManagerConfig,
        db: Database,
        placement: Arc<dyn ModelPlacement>,
    ) -> ApiResult<Self> {
        let registry = Arc::new(ModelRegistry::load_from_db(db.clone())?);
        let api_keys = Arc::new(ApiKeyManager::load_from_db(
            db.clone(),
            config.auth.admin_api_key.as_deref(),
        )?);
        let directory = Arc::new(WorkerDirectory::new(config.workers.clone()));
        let authority = Arc::new(SessionAuthority::new(
            directory.clone(),
            config.sessions.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            directory.clone(),
            authority.clone(),
            placement,
            config.dispatch.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            db,
            registry,
            directory,
            authority,
            dispatcher,
            api_keys,
        })
    }

    /// Run blocking store work (anything touching SQLite) off the async runtime.
    pub async fn blocking<T, F>(&self, f: F) -> ApiResult<T>
    where
        F: FnOnce(AppState) -> ApiResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = self.clone();
        tokio::task::spawn_blocking(move || f(state))
            .await
            .map_err(|e| ApiError::Internal(format!("Task join error: {}", e)))?
    }
}
