use super::*;
use axum::body::Body;
use axum::http::{header, Request};
use stardeck_core::config::EngineTimeouts;
use stardeck_core::{paths, BackupManager, ContainerEngine, DockerCli, MetadataStore, StackDriver};
use std::collections::HashMap;
use tempfile::TempDir;
use tower::ServiceExt;

/// App state over an in-memory store and an engine binary that does not exist.
pub(crate) async fn test_state(tokens: &[(&str, &str)]) -> (Arc<AppState>, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = Config {
        data_dir: dir.path().to_string_lossy().to_string(),
        engine_binary: "stardeck-test-no-such-engine".to_string(),
        api_tokens: tokens
            .iter()
            .map(|(token, user)| (token.to_string(), user.to_string()))
            .collect::<HashMap<_, _>>(),
        ..Default::default()
    };

    let state = Arc::new(StateManager::new_in_memory().await.unwrap());
    let engine: Arc<dyn ContainerEngine> =
        Arc::new(DockerCli::new(&config.engine_binary, EngineTimeouts::default()));
    let store: Arc<dyn MetadataStore> = state.clone();
    let backups = BackupManager::new(store.clone(), paths::backups_dir(dir.path()));
    let stacks = StackDriver::new(engine.clone(), paths::stacks_dir(dir.path()));
    let workflows =
        Workflows::new(engine, store, state.clone(), backups, stacks, Default::default());

    let health = HealthChecker::new();
    health.register_subsystem(stardeck_core::observability::health::DATABASE).await;
    health.register_subsystem(stardeck_core::observability::health::ENGINE).await;

    let app = AppState {
        workflows,
        state,
        health,
        supervisor: Supervisor::new(),
        config: Arc::new(config),
    };
    (Arc::new(app), dir)
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

fn post_json(uri: &str, token: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_is_public_and_reports_engine_degraded() {
    let (state, _dir) = test_state(&[("t0ken", "alice")]).await;

    let (status, body) = send(router(state), get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    let engine = body["subsystems"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["name"] == "engine")
        .unwrap()
        .clone();
    assert_eq!(engine["status"], "degraded");
}

#[tokio::test]
async fn api_requires_a_known_token() {
    let (state, _dir) = test_state(&[("t0ken", "alice")]).await;

    let (status, body) = send(router(state.clone()), get("/api/v1/stacks", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("missing"));

    let (status, _) = send(router(state.clone()), get("/api/v1/stacks", Some("wrong"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(router(state), get("/api/v1/stacks", Some("t0ken"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));
}

#[tokio::test]
async fn engine_outage_maps_to_service_unavailable() {
    let (state, _dir) = test_state(&[]).await;

    let (status, body) = send(router(state), get("/api/v1/containers", None)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("stardeck-test-no-such-engine"));
}

#[tokio::test]
async fn invalid_stack_is_rejected_before_the_engine_is_touched() {
    let (state, _dir) = test_state(&[("t0ken", "alice")]).await;

    let request = post_json(
        "/api/v1/stacks",
        "t0ken",
        serde_json::json!({ "name": "blog", "composeContent": "version: '3'\n" }),
    );
    let (status, body) = send(router(state.clone()), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("services"));
    assert!(state.state.get_stack_by_name("blog").await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_stack_action_is_bad_request() {
    let (state, _dir) = test_state(&[("t0ken", "alice")]).await;

    let (status, body) =
        send(router(state), post_json("/api/v1/stacks/blog/explode", "t0ken", serde_json::json!({})))
            .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("explode"));
}

#[tokio::test]
async fn missing_records_are_not_found() {
    let (state, _dir) = test_state(&[]).await;

    let (status, _) = send(router(state.clone()), get("/api/v1/backups/nope", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(router(state), get("/api/v1/stacks/nope", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn audit_log_lists_recorded_events() {
    let (state, _dir) = test_state(&[]).await;
    let actor = Actor::new("alice", Some("10.1.2.3".to_string()));
    state.audit("volume.create", "data", &actor, serde_json::json!({ "driver": "local" })).await;

    let (status, body) = send(router(state), get("/api/v1/audit?limit=5", None)).await;
    assert_eq!(status, StatusCode::OK);
    let events = body.as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["action"], "volume.create");
    assert_eq!(events[0]["actorId"], "alice");
    assert_eq!(events[0]["actorIp"], "10.1.2.3");
}
