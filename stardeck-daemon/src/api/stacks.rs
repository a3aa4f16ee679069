use super::error::ApiError;
use super::AppState;
use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use stardeck_core::engine::ComposeAction;
use stardeck_core::stack::StackState;
use stardeck_core::store::resolve_stack;
use stardeck_core::types::ContainerSummary;
use stardeck_core::workflows::StackDeployRequest;
use stardeck_core::{Actor, Operation, OperationResult, StackRecord};
use std::sync::Arc;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackView {
    pub record: StackRecord,
    pub state: StackState,
}

async fn list_stacks(State(state): State<Arc<AppState>>) -> Result<Json<Vec<StackRecord>>, ApiError> {
    Ok(Json(state.workflows.store().list_stacks().await?))
}

async fn get_stack(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StackView>, ApiError> {
    let record = resolve_stack(state.workflows.store().as_ref(), &id).await?;
    let stack_state = state.workflows.stacks().status(&record.name).await?;
    Ok(Json(StackView { record, state: stack_state }))
}

async fn stack_containers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ContainerSummary>>, ApiError> {
    let record = resolve_stack(state.workflows.store().as_ref(), &id).await?;
    Ok(Json(state.workflows.stacks().containers(&record.name).await?))
}

async fn deploy_stack(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Json(request): Json<StackDeployRequest>,
) -> Result<(StatusCode, Json<OperationResult>), ApiError> {
    let result = state.run_operation(Operation::DeployStack(request), actor).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

async fn stack_action(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Path((id, action)): Path<(String, String)>,
) -> Result<Json<OperationResult>, ApiError> {
    let command = ComposeAction::parse(&action)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown stack action '{}'", action)))?;
    let operation = Operation::StackAction { stack: id, command };
    Ok(Json(state.run_operation(operation, actor).await?))
}

async fn remove_stack(
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OperationResult>, ApiError> {
    Ok(Json(state.run_operation(Operation::RemoveStack { stack: id }, actor).await?))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_stacks).post(deploy_stack))
        .route("/{id}", get(get_stack).delete(remove_stack))
        .route("/{id}/containers", get(stack_containers))
        .route("/{id}/{action}", post(stack_action))
}
