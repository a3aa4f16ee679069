use super::error::ApiError;
use super::AppState;
use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use stardeck_core::types::BackupManifest;
use stardeck_core::{Actor, BackupRecord};
use std::sync::Arc;

#[derive(Deserialize)]
pub struct ListQuery {
    /// Container record id
    container: Option<String>,
}

async fn list_backups(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BackupRecord>>, ApiError> {
    Ok(Json(state.workflows.backups().list(query.container.as_deref()).await?))
}

async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BackupRecord>, ApiError> {
    Ok(Json(state.workflows.backups().get(&id).await?))
}

async fn backup_manifest(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BackupManifest>, ApiError> {
    Ok(Json(state.workflows.backups().manifest(&id).await?))
}

async fn delete_backup(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.workflows.delete_backup(&id, &actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_backups))
        .route("/{id}", get(get_backup).delete(delete_backup))
        .route("/{id}/manifest", get(backup_manifest))
}
