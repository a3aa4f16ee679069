use super::error::ApiError;
use super::AppState;
use axum::{
    extract::{Extension, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use stardeck_core::types::{ImageDetails, ImageSummary};
use stardeck_core::Actor;
use std::sync::Arc;

/// Image references contain `/` and `:`, so they travel in the query string.
#[derive(Deserialize)]
pub struct ImageQuery {
    reference: String,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
pub struct PullRequest {
    reference: String,
}

#[derive(Serialize)]
pub struct PullResponse {
    reference: String,
    output: Vec<String>,
}

async fn list_images(State(state): State<Arc<AppState>>) -> Result<Json<Vec<ImageSummary>>, ApiError> {
    Ok(Json(state.workflows.engine().list_images().await?))
}

async fn inspect_image(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ImageQuery>,
) -> Result<Json<ImageDetails>, ApiError> {
    Ok(Json(state.workflows.engine().inspect_image(&query.reference).await?))
}

async fn pull_image(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Json(request): Json<PullRequest>,
) -> Result<Json<PullResponse>, ApiError> {
    if request.reference.trim().is_empty() {
        return Err(ApiError::BadRequest("image reference is required".to_string()));
    }
    let output = state.workflows.engine().pull_image(&request.reference).await?.collect().await?;
    state.audit("image.pull", &request.reference, &actor, json!({})).await;
    Ok(Json(PullResponse { reference: request.reference, output }))
}

async fn remove_image(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ImageQuery>,
) -> Result<StatusCode, ApiError> {
    state.workflows.engine().remove_image(&query.reference, query.force).await?;
    state.audit("image.remove", &query.reference, &actor, json!({ "force": query.force })).await;
    Ok(StatusCode::NO_CONTENT)
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_images).delete(remove_image))
        .route("/inspect", get(inspect_image))
        .route("/pull", post(pull_image))
}
