use control_plane::api::create_router;
use control_plane::services::api_keys::{NewApiKey, Permission};
use control_plane::services::HttpPlacement;
use control_plane::{AppState, Database, ManagerConfig};
use infermesh_common::wire::{
    AssignResponse, HeartbeatResponse, ListWorkersResponse, ValidateSessionResponse,
};
use infermesh_common::{ErrorBody, ErrorKind, ModelRef, Stage, VersionSelector};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn manager(db: Database, config: ManagerConfig) -> AppState {
    let placement = Arc::new(HttpPlacement::new(Duration::from_secs(1)).unwrap());
    AppState::new(config, db, placement).unwrap()
}

fn linear_manifest(version: &str, stage: &str) -> serde_json::Value {
    json!({
        "model_id": "linear",
        "version": version,
        "stage": stage,
        "schema": {
            "inputs": [{ "name": "input", "dtype": "f32", "shape": [null, 5] }],
            "outputs": [{ "name": "output", "dtype": "f32", "shape": [null, 5] }]
        },
        "artifact": { "kind": "affine", "scale": 2.0, "bias": 1.0 },
        "tags": ["regression"]
    })
}

async fn serve(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_catalog_and_keys_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manager.db");
    let path = path.to_str().unwrap();

    let key = {
        let db = Database::new(path).unwrap();
        db.migrate().unwrap();
        let state = manager(db, ManagerConfig::default());

        let base = serve(state.clone()).await;
        let client = reqwest::Client::new();
        for (version, stage) in [("v1", "prod"), ("v2", "dev")] {
            let resp = client
                .post(format!("{}/api/v1/models", base))
                .json(&linear_manifest(version, stage))
                .send()
                .await
                .unwrap();
            assert!(resp.status().is_success());
        }

        let (key, _) = state
            .api_keys
            .create(NewApiKey {
                name: "app".into(),
                permissions: vec![Permission::Inference],
                min_stage: Stage::Prod,
                expires_in_secs: None,
                rate_limit_per_minute: 0,
            })
            .unwrap();
        key
    };

    let db = Database::new(path).unwrap();
    db.migrate().unwrap();
    let state = manager(db, ManagerConfig::default());

    let prod = state
        .registry
        .resolve("linear", &VersionSelector::Latest, Stage::Prod)
        .unwrap();
    assert_eq!(prod.version, "v1");
    let dev = state
        .registry
        .resolve("linear", &VersionSelector::Latest, Stage::Dev)
        .unwrap();
    assert_eq!(dev.version, "v2");

    // Sequence numbers continue past what was stored.
    let mut next = (*prod).clone();
    next.version = "v3".into();
    let v3 = state.registry.publish(next).unwrap();
    assert!(v3.publish_seq > dev.publish_seq);

    let identity = state
        .api_keys
        .authenticate(Some(&key), Permission::Inference)
        .unwrap();
    assert_eq!(identity.name, "app");
}

#[tokio::test]
async fn test_assignment_over_http() {
    let db = Database::open_in_memory().unwrap();
    let state = manager(db, ManagerConfig::default());
    let base = serve(state).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/api/v1/models", base))
        .json(&linear_manifest("v1", "prod"))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let heartbeat: HeartbeatResponse = client
        .post(format!("{}/api/v1/workers/heartbeat", base))
        .json(&json!({
            "worker_id": "w1",
            "address": "http://127.0.0.1:1",
            "capabilities": {
                "accelerator": "cpu",
                "max_concurrent_sessions": 1,
                "cpu_cores": 4,
                "ram_mb": 4096,
                "os": "linux",
                "arch": "x86_64"
            },
            "loaded_models": [{ "model_id": "linear", "version": "v1" }],
            "active_sessions": 0
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(heartbeat.registered);

    let assign = |client: reqwest::Client| {
        let base = base.clone();
        async move {
            client
                .post(format!("{}/api/v1/assign", base))
                .json(&json!({ "model_id": "linear" }))
                .send()
                .await
                .unwrap()
        }
    };

    let resp = assign(client.clone()).await;
    assert_eq!(resp.status(), 200);
    let assignment: AssignResponse = resp.json().await.unwrap();
    assert_eq!(assignment.worker_id, "w1");
    assert_eq!(assignment.model, ModelRef::new("linear", "v1"));

    // Capacity 1 and the slot is held by the outstanding credential.
    let resp = assign(client.clone()).await;
    assert_eq!(resp.status(), 503);
    let body: ErrorBody = resp.json().await.unwrap();
    assert_eq!(body.kind, ErrorKind::NoAvailableWorker);

    let validated: ValidateSessionResponse = client
        .post(format!("{}/api/v1/sessions/validate", base))
        .json(&json!({ "credential": assignment.credential, "worker_id": "w1" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(validated.grant.model, ModelRef::new("linear", "v1"));

    // Single use: a replayed credential is rejected.
    let resp = client
        .post(format!("{}/api/v1/sessions/validate", base))
        .json(&json!({ "credential": assignment.credential, "worker_id": "w1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: ErrorBody = resp.json().await.unwrap();
    assert_eq!(body.kind, ErrorKind::InvalidSession);

    // The consumed credential no longer holds the slot.
    assert_eq!(assign(client.clone()).await.status(), 200);

    let workers: ListWorkersResponse = client
        .get(format!("{}/api/v1/workers", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(workers.workers.len(), 1);
}
