//! In-place container update.
//!
//! The orchestrator replaces a container with one running a (possibly different) image
//! under the same name and configuration, using the rename-swap pattern:
//!
//! ```text
//! ReadConfig -> Backup -> PullImage -> StopOriginal -> RenameOriginal -> CreateReplacement
//!     -> StartReplacement -> UpdateMetadata -> Cleanup -> Complete
//! ```
//!
//! Renaming the original is the commit point. Failures before it abort with nothing to undo.
//! Failures after it run their compensation before the error is returned, so exactly one
//! container holds the original name when the workflow ends.

use crate::backup::BackupManager;
use crate::engine::ContainerEngine;
use crate::error::{Result, StardeckError};
use crate::locks::OperationLocks;
use crate::progress::{Completion, OperationResult, ProgressEvent, ProgressReporter, Step};
use crate::store::{resolve_container, MetadataStore};
use crate::types::{ContainerDetails, ContainerRecord, ContainerStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Parameters of one update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateRequest {
    /// Record id, engine id or name
    pub container: String,
    /// Target image; `None` re-pulls the current tag
    pub image: Option<String>,
    /// Archive bind mounts before touching the container
    pub backup: bool,
    pub overwrite_backup: bool,
    /// Remove the renamed original once the replacement runs
    pub remove_old: bool,
    /// Grace period for stopping the original, in seconds
    pub stop_timeout: Option<u64>,
}

/// Phases of an update session, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdatePhase {
    ReadConfig,
    Backup,
    PullImage,
    StopOriginal,
    RenameOriginal,
    CreateReplacement,
    StartReplacement,
    UpdateMetadata,
    Cleanup,
    Complete,
}

impl UpdatePhase {
    pub fn step(&self) -> Step {
        match self {
            Self::ReadConfig => Step::Config,
            Self::Backup => Step::Backup,
            Self::PullImage => Step::Pull,
            Self::StopOriginal => Step::Stop,
            Self::RenameOriginal => Step::Rename,
            Self::CreateReplacement => Step::Create,
            Self::StartReplacement => Step::Start,
            Self::UpdateMetadata => Step::Metadata,
            Self::Cleanup => Step::Cleanup,
            Self::Complete => Step::Complete,
        }
    }
}

/// Working state of one in-flight update. Never shared across requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSession {
    pub container_name: String,
    pub old_engine_id: String,
    pub new_engine_id: Option<String>,
    /// The renamed original, once the commit point has passed
    pub backup_container: Option<String>,
    pub backup_id: Option<String>,
    pub phase: UpdatePhase,
}

impl UpdateSession {
    fn new(details: &ContainerDetails) -> Self {
        Self {
            container_name: details.name.clone(),
            old_engine_id: details.engine_id.clone(),
            new_engine_id: None,
            backup_container: None,
            backup_id: None,
            phase: UpdatePhase::ReadConfig,
        }
    }

    fn enter(&mut self, phase: UpdatePhase) {
        debug!(container = %self.container_name, phase = ?phase, "update phase");
        self.phase = phase;
    }

    pub fn is_committed(&self) -> bool {
        self.backup_container.is_some()
    }
}

/// Result of a successful update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOutcome {
    pub record_id: String,
    pub engine_id: String,
    pub image: String,
    /// Retained original, when it was not removed
    pub backup_container: Option<String>,
    pub backup_id: Option<String>,
    pub warnings: Vec<String>,
}

impl UpdateOutcome {
    pub fn to_result(&self) -> OperationResult {
        OperationResult {
            container_id: Some(self.record_id.clone()),
            engine_id: Some(self.engine_id.clone()),
            image: Some(self.image.clone()),
            backup_container: self.backup_container.clone(),
            backup_id: self.backup_id.clone(),
            ..Default::default()
        }
    }
}

/// Name the original is renamed to at the commit point.
pub fn backup_container_name(name: &str, at: DateTime<Utc>) -> String {
    format!("{}_backup_{}", name, at.format("%Y%m%d%H%M%S"))
}

/// Whether a container name was produced by `backup_container_name`.
pub fn is_backup_container_name(name: &str) -> bool {
    match name.rsplit_once("_backup_") {
        Some((base, stamp)) => {
            !base.is_empty() && stamp.len() == 14 && stamp.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Runs update sessions.
#[derive(Clone)]
pub struct UpdateOrchestrator {
    engine: Arc<dyn ContainerEngine>,
    store: Arc<dyn MetadataStore>,
    backups: BackupManager,
    locks: OperationLocks,
    default_stop_timeout: Duration,
    /// Bound on everything before the commit point.
    pre_commit_timeout: Duration,
}

impl UpdateOrchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        store: Arc<dyn MetadataStore>,
        backups: BackupManager,
        locks: OperationLocks,
    ) -> Self {
        Self {
            engine,
            store,
            backups,
            locks,
            default_stop_timeout: Duration::from_secs(30),
            pre_commit_timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_default_stop_timeout(mut self, timeout: Duration) -> Self {
        self.default_stop_timeout = timeout;
        self
    }

    pub fn with_pre_commit_timeout(mut self, timeout: Duration) -> Self {
        self.pre_commit_timeout = timeout;
        self
    }

    /// Run an update and send its terminal event.
    pub async fn execute(
        &self,
        request: UpdateRequest,
        progress: &ProgressReporter,
    ) -> Result<UpdateOutcome> {
        let started = Instant::now();
        let result = self.update(request, progress).await;

        let label = match &result {
            Ok(_) => "success",
            Err(StardeckError::RollbackFailed { .. }) => "rollback_failed",
            Err(_) => "failure",
        };
        metrics::counter!("stardeck_update_total", "result" => label).increment(1);
        metrics::histogram!("stardeck_workflow_duration_seconds", "kind" => "update")
            .record(started.elapsed().as_secs_f64());

        let completion = match &result {
            Ok(outcome) => Completion::success(outcome.to_result(), outcome.warnings.clone()),
            Err(e) => Completion::failure(e, OperationResult::default()),
        };
        progress.finish(completion).await;
        result
    }

    /// Read a container's recreatable configuration, enriched with its record.
    ///
    /// Settings the container only inherited from its image are dropped, so the new image's
    /// own defaults apply to the replacement.
    #[instrument(skip(self, record), fields(container = %record.name))]
    pub async fn read_config(&self, record: &ContainerRecord) -> Result<ContainerDetails> {
        let mut details = self.engine.inspect_container(&record.engine_id).await?;

        let image_ref =
            if details.image_id.is_empty() { details.spec.image.clone() } else { details.image_id.clone() };
        match self.engine.inspect_image(&image_ref).await {
            Ok(image) => details.spec.strip_image_defaults(&image),
            Err(e) => debug!("image {} not inspectable, keeping full config: {}", image_ref, e),
        }

        for (key, value) in &record.labels {
            details.spec.labels.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Ok(details)
    }

    /// Run the update state machine without sending the terminal event.
    #[instrument(skip(self, request, progress), fields(container = %request.container))]
    pub async fn update(
        &self,
        request: UpdateRequest,
        progress: &ProgressReporter,
    ) -> Result<UpdateOutcome> {
        let started = Instant::now();

        // ReadConfig
        progress.step(Step::Config, format!("Reading configuration of {}", request.container)).await;
        let record = resolve_container(self.store.as_ref(), &request.container)
            .await
            .map_err(|e| e.at_step("config"))?;
        let _guard = self.locks.container(&record.name).map_err(|e| e.at_step("config"))?;
        // Re-read under the lock: an update that just finished may have repointed it.
        let record = self.store.get_container(&record.id).await.map_err(|e| e.at_step("config"))?;
        let details = self.read_config(&record).await.map_err(|e| e.at_step("config"))?;
        if details.name != record.name {
            return Err(StardeckError::conflict(format!(
                "record '{}' points at engine container '{}'",
                record.name, details.name
            ))
            .at_step("config"));
        }

        let mut session = UpdateSession::new(&details);
        let explicit_image = request.image.clone().filter(|i| !i.trim().is_empty());
        let target_image = explicit_image.clone().unwrap_or_else(|| details.spec.image.clone());
        let mut spec = details.spec.clone();
        spec.name = details.name.clone();
        spec.image = target_image.clone();
        let was_running = details.running;
        let stop_timeout = request
            .stop_timeout
            .map(Duration::from_secs)
            .unwrap_or(self.default_stop_timeout);

        info!(
            container = %details.name,
            from = %details.spec.image,
            to = %target_image,
            "Updating container"
        );

        // Backup
        session.enter(UpdatePhase::Backup);
        self.check_deadline(started, Step::Backup)?;
        if request.backup {
            if spec.bind_mounts().next().is_none() {
                progress.step(Step::Backup, "No bind mounts; skipping filesystem backup").await;
            } else {
                progress.step(Step::Backup, "Backing up bind mounts").await;
                let backup = self
                    .backups
                    .create(&record, &details, request.overwrite_backup, progress)
                    .await
                    .map_err(|e| e.at_step("backup"))?;
                progress
                    .emit(ProgressEvent::BackupCreated {
                        backup_id: backup.id.clone(),
                        path: backup.backup_path.clone(),
                        size_bytes: backup.size_bytes,
                    })
                    .await;
                session.backup_id = Some(backup.id);
            }
        }

        // PullImage
        session.enter(UpdatePhase::PullImage);
        self.check_deadline(started, Step::Pull)?;
        self.pull(&target_image, explicit_image.is_some(), progress)
            .await
            .map_err(|e| e.at_step("pull"))?;

        // StopOriginal
        session.enter(UpdatePhase::StopOriginal);
        self.check_deadline(started, Step::Stop)?;
        progress.step(Step::Stop, format!("Stopping {}", details.name)).await;
        if let Err(e) = self.engine.stop_container(&details.engine_id, stop_timeout).await {
            warn!(container = %details.name, "stop failed, continuing: {}", e);
            progress.step(Step::Stop, format!("Stop reported an error, continuing: {}", e)).await;
        }

        // RenameOriginal (commit point)
        session.enter(UpdatePhase::RenameOriginal);
        let backup_name = backup_container_name(&details.name, Utc::now());
        progress.step(Step::Rename, format!("Renaming {} to {}", details.name, backup_name)).await;
        if let Err(e) = self.engine.rename_container(&details.engine_id, &backup_name).await {
            if was_running {
                if let Err(restart) = self.engine.start_container(&details.engine_id).await {
                    warn!(container = %details.name, "restart after failed rename failed: {}", restart);
                }
            }
            return Err(e.at_step("rename"));
        }
        session.backup_container = Some(backup_name.clone());
        progress.emit(ProgressEvent::Renamed { backup_name: backup_name.clone() }).await;

        // CreateReplacement
        session.enter(UpdatePhase::CreateReplacement);
        progress.step(Step::Create, format!("Creating {} from {}", spec.name, spec.image)).await;
        let new_engine_id = match self.engine.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                return Err(self
                    .compensate(&mut session, &record, Step::Create, e, was_running, progress)
                    .await)
            }
        };
        session.new_engine_id = Some(new_engine_id.clone());
        progress.emit(ProgressEvent::Created { engine_id: new_engine_id.clone() }).await;

        // StartReplacement
        session.enter(UpdatePhase::StartReplacement);
        progress.step(Step::Start, format!("Starting {}", spec.name)).await;
        if let Err(e) = self.engine.start_container(&new_engine_id).await {
            return Err(self
                .compensate(&mut session, &record, Step::Start, e, was_running, progress)
                .await);
        }

        // UpdateMetadata
        session.enter(UpdatePhase::UpdateMetadata);
        let mut warnings = Vec::new();
        if let Err(e) = self
            .store
            .update_container_engine_state(
                &record.id,
                &new_engine_id,
                &target_image,
                ContainerStatus::Running,
            )
            .await
        {
            let message = format!("Container is running but its record may be stale: {}", e);
            warn!(container = %spec.name, "{}", message);
            progress.warning(Step::Metadata, message.clone()).await;
            warnings.push(message);
        }

        // Cleanup
        session.enter(UpdatePhase::Cleanup);
        let mut retained = Some(backup_name);
        if request.remove_old {
            progress.step(Step::Cleanup, "Removing the previous container").await;
            match self.engine.remove_container(&session.old_engine_id, true).await {
                Ok(()) => retained = None,
                Err(e) => {
                    let message = format!(
                        "Previous container kept as {}: {}",
                        retained.as_deref().unwrap_or_default(),
                        e
                    );
                    warn!(container = %spec.name, "{}", message);
                    progress.warning(Step::Cleanup, message.clone()).await;
                    warnings.push(message);
                }
            }
        }

        session.enter(UpdatePhase::Complete);
        info!(container = %spec.name, engine_id = %new_engine_id, "Container updated");

        Ok(UpdateOutcome {
            record_id: record.id,
            engine_id: new_engine_id,
            image: target_image,
            backup_container: retained,
            backup_id: session.backup_id,
            warnings,
        })
    }

    fn check_deadline(&self, started: Instant, step: Step) -> Result<()> {
        if started.elapsed() > self.pre_commit_timeout {
            return Err(StardeckError::Timeout {
                operation: "update".to_string(),
                seconds: self.pre_commit_timeout.as_secs(),
            }
            .at_step(step.as_str()));
        }
        Ok(())
    }

    /// Explicit targets are pulled only when missing; re-pulls of the current tag always pull.
    async fn pull(&self, image: &str, explicit: bool, progress: &ProgressReporter) -> Result<()> {
        progress.step(Step::Pull, format!("Resolving image {}", image)).await;
        if explicit && self.engine.image_exists(image).await? {
            progress.step(Step::Pull, format!("Image {} already present", image)).await;
            return Ok(());
        }
        progress.step(Step::Pull, format!("Pulling {}", image)).await;
        let lines = self.engine.pull_image(image).await?;
        progress.relay(Step::Pull, lines).await
    }

    /// Undo everything after the commit point and restore the original under its name.
    async fn compensate(
        &self,
        session: &mut UpdateSession,
        record: &ContainerRecord,
        failed: Step,
        cause: StardeckError,
        was_running: bool,
        progress: &ProgressReporter,
    ) -> StardeckError {
        metrics::counter!("stardeck_update_rollbacks_total").increment(1);
        error!(container = %session.container_name, step = %failed, "update step failed: {}", cause);
        progress.error(failed, cause.to_string()).await;
        progress.step(Step::Rollback, "Restoring the original container").await;

        let mut problems = Vec::new();

        match session.new_engine_id.take() {
            Some(new_id) => {
                if let Err(e) = self.engine.remove_container(&new_id, true).await {
                    problems.push(format!("remove replacement {}: {}", new_id, e));
                    session.new_engine_id = Some(new_id);
                }
            }
            None => {
                // Create is not idempotent; a partial create may still hold the name.
                match self.engine.inspect_container(&session.container_name).await {
                    Ok(partial) if partial.engine_id != session.old_engine_id => {
                        if let Err(e) = self.engine.remove_container(&partial.engine_id, true).await {
                            problems.push(format!("remove partial container: {}", e));
                        }
                    }
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => problems.push(format!("check for partial container: {}", e)),
                }
            }
        }

        if problems.is_empty() {
            if let Some(backup_name) = session.backup_container.clone() {
                match self
                    .engine
                    .rename_container(&session.old_engine_id, &session.container_name)
                    .await
                {
                    Ok(()) => session.backup_container = None,
                    Err(e) => problems.push(format!(
                        "rename {} back to {}: {}",
                        backup_name, session.container_name, e
                    )),
                }
            }
        }

        if !problems.is_empty() {
            let rollback = problems.join("; ");
            error!(container = %session.container_name, "rollback failed: {}", rollback);
            progress.error(Step::Rollback, format!("Rollback failed: {}", rollback)).await;
            return StardeckError::RollbackFailed {
                step: failed.as_str().to_string(),
                cause: cause.to_string(),
                rollback,
            };
        }

        let mut status = ContainerStatus::Exited;
        if was_running {
            match self.engine.start_container(&session.old_engine_id).await {
                Ok(()) => status = ContainerStatus::Running,
                Err(e) => {
                    warn!(container = %session.container_name, "original did not restart: {}", e);
                    progress
                        .warning(Step::Rollback, format!("Original restored but not restarted: {}", e))
                        .await;
                }
            }
        }
        if let Err(e) = self.store.update_container_status(&record.id, status).await {
            warn!(container = %session.container_name, "status update after rollback failed: {}", e);
        }

        progress.step(Step::Rollback, format!("Restored {}", session.container_name)).await;
        info!(container = %session.container_name, "Rollback complete");
        cause.at_step(failed.as_str())
    }
}
