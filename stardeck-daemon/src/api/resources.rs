//! Volume and network endpoints.

use super::error::ApiError;
use super::AppState;
use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use stardeck_core::types::{NetworkSummary, ResourceCreate, VolumeSummary};
use stardeck_core::Actor;
use std::sync::Arc;

#[derive(Deserialize, Default)]
pub struct RemoveQuery {
    #[serde(default)]
    force: bool,
}

#[derive(Serialize)]
pub struct Created {
    id: String,
}

fn require_name(request: &ResourceCreate, kind: &str) -> Result<(), ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{} name is required", kind)));
    }
    Ok(())
}

async fn list_volumes(State(state): State<Arc<AppState>>) -> Result<Json<Vec<VolumeSummary>>, ApiError> {
    Ok(Json(state.workflows.engine().list_volumes().await?))
}

async fn create_volume(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Json(request): Json<ResourceCreate>,
) -> Result<(StatusCode, Json<Created>), ApiError> {
    require_name(&request, "volume")?;
    let id = state.workflows.engine().create_volume(&request).await?;
    state.audit("volume.create", &request.name, &actor, json!({ "driver": request.driver })).await;
    Ok((StatusCode::CREATED, Json(Created { id })))
}

async fn remove_volume(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<StatusCode, ApiError> {
    state.workflows.engine().remove_volume(&name, query.force).await?;
    state.audit("volume.remove", &name, &actor, json!({ "force": query.force })).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_networks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<NetworkSummary>>, ApiError> {
    Ok(Json(state.workflows.engine().list_networks().await?))
}

async fn create_network(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Json(request): Json<ResourceCreate>,
) -> Result<(StatusCode, Json<Created>), ApiError> {
    require_name(&request, "network")?;
    let id = state.workflows.engine().create_network(&request).await?;
    state.audit("network.create", &request.name, &actor, json!({ "driver": request.driver })).await;
    Ok((StatusCode::CREATED, Json(Created { id })))
}

async fn remove_network(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.workflows.engine().remove_network(&name).await?;
    state.audit("network.remove", &name, &actor, json!({})).await;
    Ok(StatusCode::NO_CONTENT)
}

pub fn volumes_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_volumes).post(create_volume))
        .route("/{name}", delete(remove_volume))
}

pub fn networks_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_networks).post(create_network))
        .route("/{name}", delete(remove_network))
}
