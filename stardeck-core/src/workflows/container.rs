//! Container deploy and lifecycle operations.

use super::Workflows;
use crate::audit::{Actor, AuditEvent};
use crate::error::{Result, StardeckError};
use crate::progress::{OperationResult, ProgressEvent, ProgressReporter, Step};
use crate::store::{resolve_container, ContainerMetadataUpdate};
use crate::types::{BackupRecord, ContainerRecord, ContainerSpec, ContainerStatus, WebUi};
use crate::update::is_backup_container_name;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// A new container plus the record metadata to store with it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerDeployRequest {
    #[serde(flatten)]
    pub spec: ContainerSpec,
    pub web_ui: Option<WebUi>,
    pub auto_start: bool,
    /// Record labels (not engine labels)
    pub record_labels: HashMap<String, String>,
}

/// Bring an existing engine container under management.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdoptRequest {
    /// Engine id or name
    pub container: String,
    pub web_ui: Option<WebUi>,
    pub auto_start: bool,
    pub labels: HashMap<String, String>,
}

/// A container addressed by a caller, managed or not.
struct Target {
    record: Option<ContainerRecord>,
    engine_id: String,
    name: String,
}

/// Engine naming rule: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
pub(crate) fn validate_container_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        _ => false,
    };
    if !valid {
        return Err(StardeckError::validation(format!("invalid container name '{}'", name)));
    }
    Ok(())
}

impl Workflows {
    async fn resolve_target(&self, key: &str) -> Result<Target> {
        match resolve_container(self.store.as_ref(), key).await {
            Ok(record) => Ok(Target {
                engine_id: record.engine_id.clone(),
                name: record.name.clone(),
                record: Some(record),
            }),
            Err(e) if e.is_not_found() => {
                let details = self.engine.inspect_container(key).await?;
                Ok(Target { record: None, engine_id: details.engine_id, name: details.name })
            }
            Err(e) => Err(e),
        }
    }

    async fn set_status(&self, target: &Target, status: ContainerStatus) {
        if let Some(record) = &target.record {
            if let Err(e) = self.store.update_container_status(&record.id, status).await {
                warn!(container = %target.name, "failed to record status {}: {}", status.as_str(), e);
            }
        }
    }

    /// Create and start a new container, then record it.
    #[instrument(skip_all, fields(container = %request.spec.name))]
    pub(crate) async fn deploy_container(
        &self,
        request: ContainerDeployRequest,
        actor: &Actor,
        progress: &ProgressReporter,
    ) -> Result<(OperationResult, Vec<String>)> {
        let ContainerDeployRequest { spec, web_ui, auto_start, record_labels } = request;

        progress.step(Step::Validate, format!("Validating {}", spec.name)).await;
        validate_container_name(&spec.name).map_err(|e| e.at_step("validate"))?;
        if spec.image.trim().is_empty() {
            return Err(StardeckError::validation("image is required").at_step("validate"));
        }
        let _guard = self.locks.container(&spec.name).map_err(|e| e.at_step("validate"))?;
        if self.engine.container_exists(&spec.name).await.map_err(|e| e.at_step("validate"))? {
            return Err(StardeckError::conflict(format!(
                "a container named '{}' already exists",
                spec.name
            ))
            .at_step("validate"));
        }
        if self.store.find_container_by_name(&spec.name).await?.is_some() {
            return Err(StardeckError::conflict(format!(
                "a record named '{}' already exists",
                spec.name
            ))
            .at_step("validate"));
        }

        progress.step(Step::Pull, format!("Resolving image {}", spec.image)).await;
        let present = self.engine.image_exists(&spec.image).await.map_err(|e| e.at_step("pull"))?;
        if present {
            progress.step(Step::Pull, format!("Image {} already present", spec.image)).await;
        } else {
            progress.step(Step::Pull, format!("Pulling {}", spec.image)).await;
            let lines = self.engine.pull_image(&spec.image).await.map_err(|e| e.at_step("pull"))?;
            progress.relay(Step::Pull, lines).await.map_err(|e| e.at_step("pull"))?;
        }

        progress.step(Step::Create, format!("Creating {}", spec.name)).await;
        let engine_id = match self.engine.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.remove_partial(&spec.name).await;
                return Err(e.at_step("create"));
            }
        };
        progress.emit(ProgressEvent::Created { engine_id: engine_id.clone() }).await;

        progress.step(Step::Start, format!("Starting {}", spec.name)).await;
        if let Err(e) = self.engine.start_container(&engine_id).await {
            progress.error(Step::Start, e.to_string()).await;
            if let Err(remove) = self.engine.remove_container(&engine_id, true).await {
                warn!(container = %spec.name, "failed to remove unstartable container: {}", remove);
            }
            return Err(e.at_step("start"));
        }

        progress.step(Step::Metadata, "Recording container").await;
        let mut record = ContainerRecord::new(&engine_id, &spec.name, &spec.image);
        record.status = ContainerStatus::Running;
        record.web_ui = web_ui.unwrap_or_default();
        record.auto_start = auto_start;
        record.labels = record_labels;
        record.created_by = actor.user_id.clone();

        let mut warnings = Vec::new();
        if let Err(e) = self.store.insert_container(&record).await {
            let message = format!("Container is running but was not recorded: {}", e);
            warn!(container = %spec.name, "{}", message);
            progress.warning(Step::Metadata, message.clone()).await;
            warnings.push(message);
        }

        self.audit(
            AuditEvent::new("container.deploy", &spec.name, actor)
                .with_details(json!({ "image": spec.image, "engineId": engine_id })),
        )
        .await;
        info!(container = %spec.name, engine_id = %engine_id, "Container deployed");

        let result = OperationResult {
            container_id: Some(record.id),
            engine_id: Some(engine_id),
            image: Some(spec.image),
            ..Default::default()
        };
        Ok((result, warnings))
    }

    /// Remove whatever a failed create left behind under `name`.
    async fn remove_partial(&self, name: &str) {
        match self.engine.inspect_container(name).await {
            Ok(partial) => {
                if let Err(e) = self.engine.remove_container(&partial.engine_id, true).await {
                    warn!(container = %name, "failed to remove partially created container: {}", e);
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(container = %name, "could not check for a partial container: {}", e),
        }
    }

    #[instrument(skip(self, actor))]
    pub async fn start_container(&self, key: &str, actor: &Actor) -> Result<()> {
        let target = self.resolve_target(key).await?;
        let _guard = self.locks.container(&target.name)?;
        self.engine.start_container(&target.engine_id).await?;
        self.set_status(&target, ContainerStatus::Running).await;
        self.audit(AuditEvent::new("container.start", &target.name, actor)).await;
        Ok(())
    }

    /// Stop with a grace period in seconds; `None` uses the configured default.
    #[instrument(skip(self, actor))]
    pub async fn stop_container(&self, key: &str, timeout: Option<u64>, actor: &Actor) -> Result<()> {
        let target = self.resolve_target(key).await?;
        let _guard = self.locks.container(&target.name)?;
        let grace = timeout.map(Duration::from_secs).unwrap_or(self.settings.default_stop_timeout);
        self.engine.stop_container(&target.engine_id, grace).await?;
        self.set_status(&target, ContainerStatus::Exited).await;
        self.audit(AuditEvent::new("container.stop", &target.name, actor)).await;
        Ok(())
    }

    #[instrument(skip(self, actor))]
    pub async fn restart_container(
        &self,
        key: &str,
        timeout: Option<u64>,
        actor: &Actor,
    ) -> Result<()> {
        let target = self.resolve_target(key).await?;
        let _guard = self.locks.container(&target.name)?;
        let grace = timeout.map(Duration::from_secs).unwrap_or(self.settings.default_stop_timeout);
        self.engine.restart_container(&target.engine_id, grace).await?;
        self.set_status(&target, ContainerStatus::Running).await;
        self.audit(AuditEvent::new("container.restart", &target.name, actor)).await;
        Ok(())
    }

    /// Remove the engine container and its record.
    #[instrument(skip(self, actor))]
    pub async fn remove_container(&self, key: &str, force: bool, actor: &Actor) -> Result<()> {
        let target = self.resolve_target(key).await?;
        let _guard = self.locks.container(&target.name)?;
        match self.engine.remove_container(&target.engine_id, force).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() && target.record.is_some() => {
                warn!(container = %target.name, "engine container already gone, removing record");
            }
            Err(e) => return Err(e),
        }
        if let Some(record) = &target.record {
            self.store.delete_container(&record.id).await?;
        }
        self.audit(
            AuditEvent::new("container.remove", &target.name, actor)
                .with_details(json!({ "force": force, "engineId": target.engine_id })),
        )
        .await;
        Ok(())
    }

    /// Create a record for a container the engine already runs.
    #[instrument(skip(self, request, actor), fields(container = %request.container))]
    pub async fn adopt_container(
        &self,
        request: AdoptRequest,
        actor: &Actor,
    ) -> Result<ContainerRecord> {
        let details = self.engine.inspect_container(&request.container).await?;
        if is_backup_container_name(&details.name) {
            return Err(StardeckError::validation(format!(
                "{} is a retained update backup; rename it before adopting",
                details.name
            )));
        }
        let _guard = self.locks.container(&details.name)?;
        if self.store.find_container_by_engine_id(&details.engine_id).await?.is_some()
            || self.store.find_container_by_name(&details.name).await?.is_some()
        {
            return Err(StardeckError::conflict(format!("{} is already managed", details.name)));
        }

        let mut record = ContainerRecord::new(&details.engine_id, &details.name, &details.spec.image);
        record.status = details.status;
        record.web_ui = request.web_ui.unwrap_or_default();
        record.auto_start = request.auto_start;
        record.labels = request.labels;
        record.created_by = actor.user_id.clone();
        self.store.insert_container(&record).await?;

        self.audit(
            AuditEvent::new("container.adopt", &record.name, actor)
                .with_details(json!({ "engineId": record.engine_id })),
        )
        .await;
        Ok(record)
    }

    /// Forget a container without touching the engine.
    #[instrument(skip(self, actor))]
    pub async fn release_container(&self, key: &str, actor: &Actor) -> Result<()> {
        let record = resolve_container(self.store.as_ref(), key).await?;
        let _guard = self.locks.container(&record.name)?;
        self.store.delete_container(&record.id).await?;
        self.audit(
            AuditEvent::new("container.release", &record.name, actor)
                .with_details(json!({ "engineId": record.engine_id })),
        )
        .await;
        Ok(())
    }

    #[instrument(skip(self, update, actor))]
    pub async fn update_container_metadata(
        &self,
        key: &str,
        update: &ContainerMetadataUpdate,
        actor: &Actor,
    ) -> Result<ContainerRecord> {
        let record = resolve_container(self.store.as_ref(), key).await?;
        let updated = self.store.update_container_metadata(&record.id, update).await?;
        self.audit(
            AuditEvent::new("container.metadata", &record.name, actor)
                .with_details(serde_json::to_value(update).unwrap_or_default()),
        )
        .await;
        Ok(updated)
    }

    /// Back up a managed container's bind mounts outside of an update.
    #[instrument(skip(self, actor, progress))]
    pub async fn backup_container(
        &self,
        key: &str,
        overwrite: bool,
        actor: &Actor,
        progress: &ProgressReporter,
    ) -> Result<BackupRecord> {
        let record = resolve_container(self.store.as_ref(), key).await?;
        let _guard = self.locks.container(&record.name)?;
        let details = self.engine.inspect_container(&record.engine_id).await?;
        let backup = self.backups.create(&record, &details, overwrite, progress).await?;
        self.audit(
            AuditEvent::new("backup.create", &record.name, actor)
                .with_details(json!({ "backupId": backup.id, "sizeBytes": backup.size_bytes })),
        )
        .await;
        Ok(backup)
    }

    #[instrument(skip(self, actor))]
    pub async fn delete_backup(&self, backup_id: &str, actor: &Actor) -> Result<()> {
        let backup = self.backups.get(backup_id).await?;
        self.backups.delete(backup_id).await?;
        self.audit(
            AuditEvent::new("backup.delete", &backup.id, actor)
                .with_details(json!({ "path": backup.backup_path })),
        )
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names() {
        for ok in ["web", "Web-1", "app.v2", "a_b"] {
            assert!(validate_container_name(ok).is_ok(), "{}", ok);
        }
        for bad in ["", "-web", "_web", "we b", "a/b"] {
            assert!(validate_container_name(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn deploy_request_flattens_spec() {
        let request: ContainerDeployRequest = serde_json::from_str(
            r#"{"name": "web", "image": "nginx:1.27", "env": ["A=1"], "autoStart": true,
                "recordLabels": {"team": "infra"}}"#,
        )
        .unwrap();
        assert_eq!(request.spec.name, "web");
        assert_eq!(request.spec.env, vec!["A=1".to_string()]);
        assert!(request.auto_start);
        assert_eq!(request.record_labels["team"], "infra");
    }
}
