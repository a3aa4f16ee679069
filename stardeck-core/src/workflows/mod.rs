//! Caller-facing workflows.
//!
//! `Workflows` bundles the engine, the store, the audit sink and the drivers built on them,
//! and exposes every mutating operation the transport offers. Streamed operations arrive as
//! one `Operation` and report through a `ProgressReporter`; each ends with exactly one
//! terminal event.

mod container;
mod stack;

pub use container::{AdoptRequest, ContainerDeployRequest};
pub use stack::StackDeployRequest;

use crate::audit::{self, Actor, AuditEvent, AuditSink};
use crate::backup::BackupManager;
use crate::engine::{ComposeAction, ContainerEngine};
use crate::error::Result;
use crate::locks::OperationLocks;
use crate::progress::{Completion, OperationResult, ProgressReporter};
use crate::stack::StackDriver;
use crate::store::MetadataStore;
use crate::update::{UpdateOrchestrator, UpdateRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument};

/// One streamed operation, as sent by a caller to start it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Operation {
    DeployContainer(ContainerDeployRequest),
    UpdateContainer(UpdateRequest),
    DeployStack(StackDeployRequest),
    #[serde(rename_all = "camelCase")]
    StackAction { stack: String, command: ComposeAction },
    #[serde(rename_all = "camelCase")]
    RemoveStack { stack: String },
}

impl Operation {
    /// Short name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeployContainer(_) => "container_deploy",
            Self::UpdateContainer(_) => "update",
            Self::DeployStack(_) => "stack_deploy",
            Self::StackAction { .. } => "stack_action",
            Self::RemoveStack { .. } => "stack_remove",
        }
    }

    /// The container or stack the operation targets.
    pub fn target(&self) -> &str {
        match self {
            Self::DeployContainer(req) => &req.spec.name,
            Self::UpdateContainer(req) => &req.container,
            Self::DeployStack(req) => &req.name,
            Self::StackAction { stack, .. } | Self::RemoveStack { stack } => stack,
        }
    }
}

/// Timeouts and defaults for workflows.
#[derive(Debug, Clone, Copy)]
pub struct WorkflowSettings {
    pub default_stop_timeout: Duration,
    pub workflow_timeout: Duration,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            default_stop_timeout: Duration::from_secs(30),
            workflow_timeout: Duration::from_secs(3600),
        }
    }
}

/// Entry point for every mutating operation.
#[derive(Clone)]
pub struct Workflows {
    engine: Arc<dyn ContainerEngine>,
    store: Arc<dyn MetadataStore>,
    audit: Arc<dyn AuditSink>,
    backups: BackupManager,
    stacks: StackDriver,
    updates: UpdateOrchestrator,
    locks: OperationLocks,
    settings: WorkflowSettings,
}

impl Workflows {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        store: Arc<dyn MetadataStore>,
        audit: Arc<dyn AuditSink>,
        backups: BackupManager,
        stacks: StackDriver,
        settings: WorkflowSettings,
    ) -> Self {
        let locks = OperationLocks::new();
        let updates = UpdateOrchestrator::new(
            Arc::clone(&engine),
            Arc::clone(&store),
            backups.clone(),
            locks.clone(),
        )
        .with_default_stop_timeout(settings.default_stop_timeout)
        .with_pre_commit_timeout(settings.workflow_timeout);

        Self { engine, store, audit, backups, stacks, updates, locks, settings }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn stacks(&self) -> &StackDriver {
        &self.stacks
    }

    pub fn updates(&self) -> &UpdateOrchestrator {
        &self.updates
    }

    pub fn locks(&self) -> &OperationLocks {
        &self.locks
    }

    /// Record an audit event for an action performed outside the workflows here.
    pub async fn audit(&self, event: AuditEvent) {
        audit::emit(&self.audit, event).await;
    }

    /// Run one streamed operation to completion and send its terminal event.
    #[instrument(skip(self, operation, actor, progress), fields(kind = operation.kind(), target = %operation.target()))]
    pub async fn run(
        &self,
        operation: Operation,
        actor: &Actor,
        progress: &ProgressReporter,
    ) -> Result<OperationResult> {
        info!("Starting operation");
        let kind = operation.kind();
        let started = Instant::now();
        let outcome = match operation {
            Operation::UpdateContainer(request) => {
                return self.run_update(request, actor, progress).await;
            }
            Operation::DeployContainer(request) => {
                self.deploy_container(request, actor, progress).await
            }
            Operation::DeployStack(request) => self.deploy_stack(request, actor, progress).await,
            Operation::StackAction { stack, command } => {
                self.stack_action(&stack, command, actor, progress).await
            }
            Operation::RemoveStack { stack } => self.remove_stack(&stack, actor, progress).await,
        };

        metrics::histogram!("stardeck_workflow_duration_seconds", "kind" => kind)
            .record(started.elapsed().as_secs_f64());

        let completion = match &outcome {
            Ok((result, warnings)) => Completion::success(result.clone(), warnings.clone()),
            Err(e) => Completion::failure(e, OperationResult::default()),
        };
        progress.finish(completion).await;
        outcome.map(|(result, _)| result)
    }

    /// The orchestrator sends its own terminal event and records its own metrics.
    async fn run_update(
        &self,
        request: UpdateRequest,
        actor: &Actor,
        progress: &ProgressReporter,
    ) -> Result<OperationResult> {
        let target = request.container.clone();
        let details = serde_json::to_value(&request).unwrap_or_default();
        let outcome = self.updates.execute(request, progress).await;
        let event = AuditEvent::new("container.update", target, actor).with_details(
            serde_json::json!({ "request": details, "success": outcome.is_ok() }),
        );
        self.audit(event).await;
        outcome.map(|o| o.to_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_parse_from_wire() {
        let op: Operation = serde_json::from_str(
            r#"{"action": "updateContainer", "container": "web", "image": "app:2.0", "backup": true, "removeOld": true}"#,
        )
        .unwrap();
        match &op {
            Operation::UpdateContainer(req) => {
                assert_eq!(req.image.as_deref(), Some("app:2.0"));
                assert!(req.backup && req.remove_old);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(op.kind(), "update");
        assert_eq!(op.target(), "web");

        let op: Operation =
            serde_json::from_str(r#"{"action": "stackAction", "stack": "blog", "command": "start"}"#)
                .unwrap();
        assert_eq!(op, Operation::StackAction { stack: "blog".into(), command: ComposeAction::Up });

        let op: Operation = serde_json::from_str(
            r#"{"action": "deployContainer", "name": "web", "image": "nginx", "autoStart": true}"#,
        )
        .unwrap();
        assert_eq!(op.target(), "web");
    }

    #[test]
    fn unknown_actions_are_rejected() {
        assert!(serde_json::from_str::<Operation>(r#"{"action": "explode"}"#).is_err());
    }
}
