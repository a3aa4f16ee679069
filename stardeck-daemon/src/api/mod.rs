//! HTTP and WebSocket API.
//!
//! REST endpoints under `/api/v1` for containers, stacks, images, volumes, networks and
//! backups, plus WebSocket endpoints for streamed operations, logs and exec.

pub mod auth;
pub mod backups;
pub mod containers;
pub mod error;
pub mod images;
pub mod resources;
pub mod stacks;
pub mod ws;

use crate::supervisor::Supervisor;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use error::ApiError;
use serde::Deserialize;
use stardeck_core::audit::AuditEvent;
use stardeck_core::observability::health::HealthStatus;
use stardeck_core::progress::{self, ProgressStream};
use stardeck_core::{
    Actor, Config, HealthChecker, Operation, OperationResult, ProgressReporter, StateManager,
    Workflows,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state for every handler.
pub struct AppState {
    pub workflows: Workflows,
    pub state: Arc<StateManager>,
    pub health: HealthChecker,
    pub supervisor: Supervisor,
    pub config: Arc<Config>,
}

impl AppState {
    /// A progress channel sized from configuration.
    pub fn progress_channel(&self) -> (ProgressReporter, ProgressStream) {
        progress::channel(self.config.progress_buffer, self.config.progress_send_timeout())
    }

    /// Start `operation` under the supervisor, reporting through `progress`.
    ///
    /// The workflow keeps running if the caller goes away; the returned receiver yields its
    /// result to callers that stay.
    pub fn spawn_operation(
        &self,
        operation: Operation,
        actor: Actor,
        progress: ProgressReporter,
    ) -> stardeck_core::Result<oneshot::Receiver<stardeck_core::Result<OperationResult>>> {
        let (tx, rx) = oneshot::channel();
        let workflows = self.workflows.clone();
        let name = format!("{}:{}", operation.kind(), operation.target());
        self.supervisor.spawn(name, async move {
            let outcome = workflows.run(operation, &actor, &progress).await;
            drop(progress);
            let _ = tx.send(outcome);
        })?;
        Ok(rx)
    }

    /// Run `operation` under the supervisor and wait for its result.
    pub async fn run_operation(
        &self,
        operation: Operation,
        actor: Actor,
    ) -> Result<OperationResult, ApiError> {
        let rx = self.spawn_operation(operation, actor, ProgressReporter::noop())?;
        let outcome = rx.await.map_err(|_| {
            stardeck_core::StardeckError::Internal("workflow ended without a result".to_string())
        })?;
        Ok(outcome?)
    }

    pub async fn audit(&self, action: &str, target: &str, actor: &Actor, details: serde_json::Value) {
        self.workflows.audit(AuditEvent::new(action, target, actor).with_details(details)).await;
    }
}

/// Build the full router.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .nest("/containers", containers::router())
        .nest("/stacks", stacks::router())
        .nest("/images", images::router())
        .nest("/volumes", resources::volumes_router())
        .nest("/networks", resources::networks_router())
        .nest("/backups", backups::router())
        .route("/audit", get(audit_log))
        .nest("/ws", ws::router())
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_identity));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.health.probe(&state.state, state.workflows.engine().as_ref()).await;
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report))
}

#[derive(Deserialize)]
struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    limit: i64,
}

fn default_audit_limit() -> i64 {
    100
}

async fn audit_log(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEvent>>, ApiError> {
    let limit = query.limit.clamp(1, 1000);
    Ok(Json(state.state.list_audit_events(limit).await?))
}

/// Serve the API until `shutdown` resolves.
pub async fn serve(
    state: Arc<AppState>,
    listener: tokio::net::TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    info!(address = ?listener.local_addr().ok(), "API server listening");
    axum::serve(listener, router(state).into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
pub(crate) mod tests;
