use crate::services::directory::WorkerRecord;
use async_trait::async_trait;
use infermesh_common::wire::{LoadModelRequest, LoadModelResponse};
use infermesh_common::{ErrorBody, ModelVersion};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum PlacementError {
    #[error("Worker {worker_id} unreachable: {message}")]
    Unreachable { worker_id: String, message: String },

    #[error("Worker {worker_id} refused to load the model: {error}")]
    Rejected { worker_id: String, error: ErrorBody },
}

/// Asks a worker to make a model resident. Used only on the cold-start path.
#[async_trait]
pub trait ModelPlacement: Send + Sync {
    async fn load_model(
        &self,
        worker: &WorkerRecord,
        model: &ModelVersion,
    ) -> Result<LoadModelResponse, PlacementError>;
}

/// Pushes load requests to the worker's HTTP API.
pub struct HttpPlacement {
    client: reqwest::Client,
}

impl HttpPlacement {
    pub fn new(timeout: Duration) -> Result<Self, PlacementError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PlacementError::Unreachable {
                worker_id: String::new(),
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ModelPlacement for HttpPlacement {
    async fn load_model(
        &self,
        worker: &WorkerRecord,
        model: &ModelVersion,
    ) -> Result<LoadModelResponse, PlacementError> {
        let url = format!("{}/api/v1/models/load", worker.address.trim_end_matches('/'));
        debug!(worker_id = %worker.worker_id, url = %url, model = %model.model_ref(), "Requesting model load");

        let unreachable = |e: reqwest::Error| PlacementError::Unreachable {
            worker_id: worker.worker_id.clone(),
            message: e.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&LoadModelRequest {
                model: model.clone(),
            })
            .send()
            .await
            .map_err(unreachable)?;

        if !response.status().is_success() {
            let status = response.status();
            let error = response.json::<ErrorBody>().await.unwrap_or_else(|_| {
                ErrorBody::new(
                    infermesh_common::ErrorKind::Internal,
                    format!("HTTP {}", status),
                )
            });
            return Err(PlacementError::Rejected {
                worker_id: worker.worker_id.clone(),
                error,
            });
        }

        let loaded = response
            .json::<LoadModelResponse>()
            .await
            .map_err(unreachable)?;

        info!(
            worker_id = %worker.worker_id,
            model = %loaded.model,
            already_loaded = loaded.already_loaded,
            evicted = loaded.evicted.len(),
            "Model placed on worker"
        );
        Ok(loaded)
    }
}
