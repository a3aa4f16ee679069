use super::error::ApiError;
use super::AppState;
use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use stardeck_core::engine::ContainerFilter;
use stardeck_core::store::{resolve_container, ContainerMetadataUpdate};
use stardeck_core::types::{ContainerStats, ContainerSummary};
use stardeck_core::workflows::{AdoptRequest, ContainerDeployRequest};
use stardeck_core::{
    Actor, BackupRecord, ContainerDetails, ContainerRecord, ContainerSpec, Operation,
    OperationResult, ProgressReporter, StardeckError, UpdateRequest,
};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Engine listing row with the managing record, if any.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerView {
    #[serde(flatten)]
    pub summary: ContainerSummary,
    pub record: Option<ContainerRecord>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInspect {
    pub details: ContainerDetails,
    pub record: Option<ContainerRecord>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_true")]
    all: bool,
    name: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct StopQuery {
    timeout: Option<u64>,
}

#[derive(Deserialize, Default)]
pub struct RemoveQuery {
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize, Default)]
pub struct BackupQuery {
    #[serde(default)]
    overwrite: bool,
}

fn default_true() -> bool {
    true
}

/// Record (when managed) and the id the engine knows the container by.
async fn lookup(state: &AppState, key: &str) -> Result<(Option<ContainerRecord>, String), ApiError> {
    match resolve_container(state.workflows.store().as_ref(), key).await {
        Ok(record) => {
            let engine_id = record.engine_id.clone();
            Ok((Some(record), engine_id))
        }
        Err(e) if e.is_not_found() => Ok((None, key.to_string())),
        Err(e) => Err(e.into()),
    }
}

async fn list_containers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ContainerView>>, ApiError> {
    let filter = ContainerFilter { all: query.all, name: query.name, labels: Vec::new() };
    let listing = state.workflows.engine().list_containers(&filter).await?;
    let records = state.workflows.store().list_containers().await?;

    let views = listing
        .into_iter()
        .map(|summary| {
            let record = records
                .iter()
                .find(|r| {
                    r.engine_id == summary.engine_id || r.engine_id.starts_with(&summary.engine_id)
                })
                .cloned();
            ContainerView { summary, record }
        })
        .collect();
    Ok(Json(views))
}

async fn list_managed(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ContainerRecord>>, ApiError> {
    Ok(Json(state.workflows.store().list_containers().await?))
}

async fn inspect_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ContainerInspect>, ApiError> {
    let (record, engine_id) = lookup(&state, &id).await?;
    let details = state.workflows.engine().inspect_container(&engine_id).await?;
    Ok(Json(ContainerInspect { details, record }))
}

async fn container_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ContainerSpec>, ApiError> {
    let (_, engine_id) = lookup(&state, &id).await?;
    let details = state.workflows.engine().inspect_container(&engine_id).await?;
    Ok(Json(details.spec))
}

async fn container_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ContainerStats>, ApiError> {
    let (_, engine_id) = lookup(&state, &id).await?;
    Ok(Json(state.workflows.engine().container_stats(&engine_id).await?))
}

async fn deploy_container(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Json(request): Json<ContainerDeployRequest>,
) -> Result<(StatusCode, Json<OperationResult>), ApiError> {
    let result = state.run_operation(Operation::DeployContainer(request), actor).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

async fn update_container(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut request): Json<UpdateRequest>,
) -> Result<Json<OperationResult>, ApiError> {
    request.container = id;
    Ok(Json(state.run_operation(Operation::UpdateContainer(request), actor).await?))
}

async fn start_container(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.workflows.start_container(&id, &actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_container(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<StopQuery>,
) -> Result<StatusCode, ApiError> {
    state.workflows.stop_container(&id, query.timeout, &actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restart_container(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<StopQuery>,
) -> Result<StatusCode, ApiError> {
    state.workflows.restart_container(&id, query.timeout, &actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_container(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<StatusCode, ApiError> {
    state.workflows.remove_container(&id, query.force, &actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn adopt_container(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Json(request): Json<AdoptRequest>,
) -> Result<(StatusCode, Json<ContainerRecord>), ApiError> {
    let record = state.workflows.adopt_container(request, &actor).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn release_container(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.workflows.release_container(&id, &actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_metadata(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<ContainerMetadataUpdate>,
) -> Result<Json<ContainerRecord>, ApiError> {
    Ok(Json(state.workflows.update_container_metadata(&id, &update, &actor).await?))
}

async fn backup_container(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<BackupQuery>,
) -> Result<(StatusCode, Json<BackupRecord>), ApiError> {
    // The backup outlives the request.
    let (tx, rx) = oneshot::channel();
    let workflows = state.workflows.clone();
    state.supervisor.spawn(format!("backup:{}", id), async move {
        let outcome = workflows
            .backup_container(&id, query.overwrite, &actor, &ProgressReporter::noop())
            .await;
        let _ = tx.send(outcome);
    })?;
    let backup = rx
        .await
        .map_err(|_| StardeckError::Internal("backup ended without a result".to_string()))??;
    Ok((StatusCode::CREATED, Json(backup)))
}

async fn container_backups(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<BackupRecord>>, ApiError> {
    let record = resolve_container(state.workflows.store().as_ref(), &id).await?;
    Ok(Json(state.workflows.backups().list(Some(&record.id)).await?))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_containers).post(deploy_container))
        .route("/managed", get(list_managed))
        .route("/adopt", post(adopt_container))
        .route("/{id}", get(inspect_container).patch(update_metadata).delete(remove_container))
        .route("/{id}/config", get(container_config))
        .route("/{id}/stats", get(container_stats))
        .route("/{id}/start", post(start_container))
        .route("/{id}/stop", post(stop_container))
        .route("/{id}/restart", post(restart_container))
        .route("/{id}/update", post(update_container))
        .route("/{id}/record", delete(release_container))
        .route("/{id}/backups", get(container_backups).post(backup_container))
}
