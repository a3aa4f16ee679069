//! Stack deploy, actions and removal.

use super::Workflows;
use crate::audit::{Actor, AuditEvent};
use crate::engine::ComposeAction;
use crate::error::Result;
use crate::progress::{OperationResult, ProgressReporter, Step};
use crate::stack::{StackDriver, StackState};
use crate::store::resolve_stack;
use crate::types::{StackRecord, StackStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

/// Compose document and environment for a stack deploy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StackDeployRequest {
    pub name: String,
    pub compose_content: String,
    pub env_content: String,
}

impl Workflows {
    /// Validate, render, pull and bring up a stack, then persist its status.
    #[instrument(skip_all, fields(stack = %request.name))]
    pub(crate) async fn deploy_stack(
        &self,
        request: StackDeployRequest,
        actor: &Actor,
        progress: &ProgressReporter,
    ) -> Result<(OperationResult, Vec<String>)> {
        progress.step(Step::Validate, format!("Validating stack {}", request.name)).await;
        StackDriver::validate_name(&request.name).map_err(|e| e.at_step("validate"))?;
        StackDriver::validate_compose(&request.compose_content)
            .map_err(|e| e.at_step("validate"))?;
        let _guard = self.locks.stack(&request.name).map_err(|e| e.at_step("validate"))?;

        let record = self.upsert_stack(&request, actor).await.map_err(|e| e.at_step("validate"))?;

        let outcome = self.bring_up(&record, &request, progress).await;
        let (status, warnings) = match &outcome {
            Ok((state, warnings)) => (state.status, warnings.clone()),
            Err(_) => (StackStatus::Error, Vec::new()),
        };
        if let Err(e) = self.store.update_stack_status(&record.id, status).await {
            warn!(stack = %record.name, "failed to persist stack status: {}", e);
        }
        record_stack_action("deploy", outcome.is_ok());

        self.audit(
            AuditEvent::new("stack.deploy", &record.name, actor).with_details(json!({
                "stackId": record.id,
                "status": status.as_str(),
                "success": outcome.is_ok(),
            })),
        )
        .await;

        outcome?;
        info!(stack = %record.name, status = status.as_str(), "Stack deployed");
        let result = OperationResult {
            stack_id: Some(record.id),
            stack_status: Some(status.as_str().to_string()),
            ..Default::default()
        };
        Ok((result, warnings))
    }

    /// Insert the stack, or point the existing record at the new content, as `deploying`.
    async fn upsert_stack(&self, request: &StackDeployRequest, actor: &Actor) -> Result<StackRecord> {
        let dir = self.stacks.stack_dir(&request.name);
        let path = dir.to_string_lossy().to_string();

        match self.store.get_stack_by_name(&request.name).await? {
            Some(mut existing) => {
                self.store
                    .update_stack_content(
                        &existing.id,
                        &request.compose_content,
                        &request.env_content,
                        &path,
                    )
                    .await?;
                self.store.update_stack_status(&existing.id, StackStatus::Deploying).await?;
                existing.compose_content = request.compose_content.clone();
                existing.env_content = request.env_content.clone();
                existing.path = path;
                existing.status = StackStatus::Deploying;
                Ok(existing)
            }
            None => {
                let now = Utc::now();
                let record = StackRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: request.name.clone(),
                    compose_content: request.compose_content.clone(),
                    env_content: request.env_content.clone(),
                    path,
                    status: StackStatus::Deploying,
                    created_by: actor.user_id.clone(),
                    created_at: now,
                    updated_at: now,
                };
                self.store.insert_stack(&record).await?;
                Ok(record)
            }
        }
    }

    async fn bring_up(
        &self,
        record: &StackRecord,
        request: &StackDeployRequest,
        progress: &ProgressReporter,
    ) -> Result<(StackState, Vec<String>)> {
        progress.step(Step::Render, "Writing compose files").await;
        let dir = self
            .stacks
            .render(&record.name, &request.compose_content, &request.env_content)
            .await
            .map_err(|e| e.at_step("render"))?;

        // Locally built images cannot be pulled; `up` reports anything truly missing.
        let mut warnings = Vec::new();
        progress.step(Step::Pull, "Pulling images").await;
        if let Err(e) = self.compose(&record.name, &dir, ComposeAction::Pull, progress).await {
            let message = format!("Image pull reported an error: {}", e);
            progress.warning(Step::Pull, message.clone()).await;
            warnings.push(message);
        }

        progress.step(Step::Compose, "Starting services").await;
        self.compose(&record.name, &dir, ComposeAction::Up, progress)
            .await
            .map_err(|e| e.at_step("compose"))?;

        progress.step(Step::Status, "Checking stack status").await;
        let state = self.stacks.status(&record.name).await.map_err(|e| e.at_step("status"))?;
        progress
            .step(
                Step::Status,
                format!("{} of {} containers running", state.running, state.total),
            )
            .await;
        Ok((state, warnings))
    }

    async fn compose(
        &self,
        name: &str,
        dir: &Path,
        action: ComposeAction,
        progress: &ProgressReporter,
    ) -> Result<()> {
        let step = if action == ComposeAction::Pull { Step::Pull } else { Step::Compose };
        let lines = self.stacks.run(name, dir, action).await?;
        progress.relay(step, lines).await
    }

    /// Run a compose action against a deployed stack and refresh its status.
    #[instrument(skip(self, actor, progress))]
    pub(crate) async fn stack_action(
        &self,
        key: &str,
        action: ComposeAction,
        actor: &Actor,
        progress: &ProgressReporter,
    ) -> Result<(OperationResult, Vec<String>)> {
        let record = resolve_stack(self.store.as_ref(), key).await.map_err(|e| e.at_step("validate"))?;
        let _guard = self.locks.stack(&record.name).map_err(|e| e.at_step("validate"))?;
        let dir = PathBuf::from(&record.path);

        progress.step(Step::Compose, format!("Running {} on {}", action, record.name)).await;
        let outcome = self.compose(&record.name, &dir, action, progress).await;
        record_stack_action(action.as_str(), outcome.is_ok());

        let status = match &outcome {
            Ok(()) => match self.stacks.status(&record.name).await {
                Ok(state) => state.status,
                Err(e) => {
                    warn!(stack = %record.name, "status refresh failed: {}", e);
                    record.status
                }
            },
            Err(_) => StackStatus::Error,
        };
        if let Err(e) = self.store.update_stack_status(&record.id, status).await {
            warn!(stack = %record.name, "failed to persist stack status: {}", e);
        }

        self.audit(
            AuditEvent::new(format!("stack.{}", action.as_str()), &record.name, actor)
                .with_details(json!({ "success": outcome.is_ok(), "status": status.as_str() })),
        )
        .await;

        outcome.map_err(|e| e.at_step("compose"))?;
        progress.step(Step::Status, format!("Stack is {}", status.as_str())).await;
        let result = OperationResult {
            stack_id: Some(record.id),
            stack_status: Some(status.as_str().to_string()),
            ..Default::default()
        };
        Ok((result, Vec::new()))
    }

    /// Take a stack down, delete its files and its record.
    #[instrument(skip(self, actor, progress))]
    pub(crate) async fn remove_stack(
        &self,
        key: &str,
        actor: &Actor,
        progress: &ProgressReporter,
    ) -> Result<(OperationResult, Vec<String>)> {
        let record = resolve_stack(self.store.as_ref(), key).await.map_err(|e| e.at_step("validate"))?;
        let _guard = self.locks.stack(&record.name).map_err(|e| e.at_step("validate"))?;
        let dir = PathBuf::from(&record.path);

        let mut warnings = Vec::new();
        progress.step(Step::Compose, format!("Taking down {}", record.name)).await;
        match self.compose(&record.name, &dir, ComposeAction::Down, progress).await {
            Ok(()) => record_stack_action("down", true),
            Err(e) if e.is_not_found() => {
                let message = format!("Stack files were missing; nothing to take down: {}", e);
                progress.warning(Step::Compose, message.clone()).await;
                warnings.push(message);
            }
            Err(e) => {
                record_stack_action("down", false);
                if let Err(status) =
                    self.store.update_stack_status(&record.id, StackStatus::Error).await
                {
                    warn!(stack = %record.name, "failed to persist stack status: {}", status);
                }
                return Err(e.at_step("compose"));
            }
        }

        progress.step(Step::Cleanup, "Removing stack files").await;
        self.stacks.remove_files(&dir).await.map_err(|e| e.at_step("cleanup"))?;
        self.store.delete_stack(&record.id).await.map_err(|e| e.at_step("cleanup"))?;

        self.audit(
            AuditEvent::new("stack.remove", &record.name, actor)
                .with_details(json!({ "stackId": record.id })),
        )
        .await;
        info!(stack = %record.name, "Stack removed");

        Ok((OperationResult { stack_id: Some(record.id), ..Default::default() }, warnings))
    }

    /// Current status of a stack, refreshed from the engine and persisted.
    #[instrument(skip(self))]
    pub async fn refresh_stack(&self, key: &str) -> Result<(StackRecord, StackState)> {
        let mut record = resolve_stack(self.store.as_ref(), key).await?;
        let state = self.stacks.status(&record.name).await?;
        if state.status != record.status && record.status != StackStatus::Deploying {
            self.store.update_stack_status(&record.id, state.status).await?;
            record.status = state.status;
        }
        Ok((record, state))
    }
}

fn record_stack_action(action: &str, success: bool) {
    let result = if success { "success" } else { "failure" };
    metrics::counter!(
        "stardeck_stack_actions_total",
        "action" => action.to_string(),
        "result" => result
    )
    .increment(1);
}
