//! HTTP client for the manager: heartbeats and credential validation.

use crate::errors::{AgentError, Result};
use crate::runtime::{SessionValidator, WorkerRuntime};
use async_trait::async_trait;
use infermesh_common::wire::{
    HeartbeatRequest, HeartbeatResponse, SessionGrant, ValidateSessionRequest,
    ValidateSessionResponse,
};
use infermesh_common::{ErrorBody, ErrorKind};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const API_KEY_HEADER: &str = "x-api-key";

/// Client for maintaining this worker's membership with the manager
#[derive(Clone)]
pub struct ControlPlaneClient {
    client: Client,
    control_plane_url: String,
    api_key: Option<String>,
}

impl ControlPlaneClient {
    pub fn new(control_plane_url: String, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| AgentError::Http(format!("Failed to build HTTP client: {}", e)))?,
            control_plane_url: control_plane_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn control_plane_url(&self) -> &str {
        &self.control_plane_url
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let request = self
            .client
            .post(format!("{}{}", self.control_plane_url, path));
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    /// Send a single heartbeat
    pub async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let response = self
            .post("/api/v1/workers/heartbeat")
            .json(request)
            .send()
            .await
            .map_err(|e| AgentError::Http(format!("Heartbeat request failed: {}", e)))?;

        let heartbeat: HeartbeatResponse = parse(response).await?;

        debug!(
            worker_id = %request.worker_id,
            registered = heartbeat.registered,
            loaded_models = request.loaded_models.len(),
            active_sessions = request.active_sessions,
            "Heartbeat sent successfully"
        );
        Ok(heartbeat)
    }

    /// Heartbeat forever. Failures are logged and retried on the next tick.
    pub async fn heartbeat_loop(self, runtime: Arc<WorkerRuntime>, address: String, period: Duration) {
        info!(worker_id = %runtime.worker_id(), "Starting heartbeat loop");

        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            match self.heartbeat(&runtime.heartbeat_request(&address)).await {
                Ok(response) if response.registered => {
                    info!(worker_id = %runtime.worker_id(), "Registered with manager");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        worker_id = %runtime.worker_id(),
                        error = %e,
                        "Heartbeat failed (will retry)"
                    );
                }
            }
        }
    }

    pub async fn validate_session(&self, credential: &str, worker_id: &str) -> Result<SessionGrant> {
        let response = self
            .post("/api/v1/sessions/validate")
            .json(&ValidateSessionRequest {
                credential: credential.to_string(),
                worker_id: worker_id.to_string(),
            })
            .send()
            .await
            .map_err(|e| AgentError::Http(format!("Session validation request failed: {}", e)))?;

        let validated: ValidateSessionResponse = parse(response).await?;
        Ok(validated.grant)
    }
}

/// Decode a success body, or the manager's `ErrorBody` on failure.
async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => AgentError::Manager(body),
            Err(_) => AgentError::Http(format!("HTTP {}: {}", status, text)),
        });
    }

    response
        .json()
        .await
        .map_err(|e| AgentError::Serialization(format!("Failed to parse response: {}", e)))
}

/// Validates credentials by asking the manager over HTTP.
pub struct RemoteSessionValidator {
    client: ControlPlaneClient,
}

impl RemoteSessionValidator {
    pub fn new(client: ControlPlaneClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SessionValidator for RemoteSessionValidator {
    async fn validate(&self, credential: &str, worker_id: &str) -> std::result::Result<SessionGrant, ErrorBody> {
        self.client
            .validate_session(credential, worker_id)
            .await
            .map_err(|e| match e {
                AgentError::Manager(body) => body,
                other => ErrorBody::new(
                    ErrorKind::Unavailable,
                    format!("session authority unreachable: {}", other),
                ),
            })
    }
}
