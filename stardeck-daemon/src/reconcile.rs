//! State reconciliation for stardeckd.
//!
//! On daemon startup, reconciles stored records with what the engine actually runs.
//! This handles containers that changed state while the daemon was down and surfaces
//! backup containers left behind by an interrupted update.

use stardeck_core::engine::ContainerFilter;
use stardeck_core::observability::metrics;
use stardeck_core::update::is_backup_container_name;
use stardeck_core::types::ContainerSummary;
use stardeck_core::{Actor, ContainerRecord, ContainerStatus, Workflows};
use std::collections::HashMap;
use tracing::{info, warn};

/// Reconciles daemon state on startup.
pub struct StateReconciler {
    workflows: Workflows,
}

/// What a reconciliation pass found.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub running: usize,
    pub stopped: usize,
    /// Records whose engine container no longer exists
    pub missing: usize,
    /// Records whose stored status was corrected
    pub corrected: usize,
    /// Exited `auto_start` containers started again
    pub auto_started: usize,
    /// Retained `<name>_backup_<timestamp>` containers
    pub leftover_backups: Vec<String>,
    pub stacks: usize,
    /// Staging directories of interrupted backups that were removed
    pub stale_staging: usize,
}

/// Status a record should have given the engine's listing (`None` when it is already right),
/// and whether its container is still there.
fn observed_status(
    record: &ContainerRecord,
    listing: &[ContainerSummary],
) -> (Option<ContainerStatus>, bool) {
    let found = listing.iter().find(|c| {
        c.engine_id == record.engine_id
            || (!c.engine_id.is_empty() && record.engine_id.starts_with(&c.engine_id))
    });
    match found {
        Some(container) if container.status != record.status => (Some(container.status), true),
        Some(_) => (None, true),
        None if record.status != ContainerStatus::Unknown => {
            (Some(ContainerStatus::Unknown), false)
        }
        None => (None, false),
    }
}

fn leftover_backups(listing: &[ContainerSummary]) -> Vec<String> {
    let mut names: Vec<String> = listing
        .iter()
        .filter(|c| is_backup_container_name(&c.name))
        .map(|c| c.name.clone())
        .collect();
    names.sort();
    names
}

impl StateReconciler {
    pub fn new(workflows: Workflows) -> Self {
        Self { workflows }
    }

    /// Reconcile stored state with the engine.
    ///
    /// This method:
    /// 1. Removes staging directories of interrupted backups
    /// 2. Lists every engine container, running or not
    /// 3. Corrects stored container statuses, marking vanished containers `unknown`
    /// 4. Starts exited containers flagged `auto_start`
    /// 5. Reports retained backup containers for manual review
    /// 6. Refreshes every stack's aggregate status
    pub async fn reconcile(&self) -> stardeck_core::Result<ReconcileReport> {
        info!("Reconciling daemon state...");

        let mut report = ReconcileReport::default();
        match self.workflows.backups().sweep_staging().await {
            Ok(removed) => report.stale_staging = removed,
            Err(e) => warn!("Failed to sweep backup staging directories: {}", e),
        }

        let listing = self.workflows.engine().list_containers(&ContainerFilter::all()).await?;
        let store = self.workflows.store();

        let mut by_status: HashMap<ContainerStatus, usize> = HashMap::new();
        for record in store.list_containers().await? {
            let (change, present) = observed_status(&record, &listing);
            if !present {
                warn!(
                    container = %record.name,
                    engine_id = %record.engine_id,
                    "Managed container no longer exists in the engine"
                );
                report.missing += 1;
            }

            let mut status = change.unwrap_or(record.status);
            if let Some(status) = change {
                match store.update_container_status(&record.id, status).await {
                    Ok(()) => report.corrected += 1,
                    Err(e) => warn!("Failed to update status of {}: {}", record.name, e),
                }
            }

            if record.auto_start && present && status == ContainerStatus::Exited {
                match self.workflows.start_container(&record.id, &Actor::system()).await {
                    Ok(()) => {
                        info!(container = %record.name, "Auto-started container");
                        report.auto_started += 1;
                        status = ContainerStatus::Running;
                    }
                    Err(e) => warn!("Failed to auto-start {}: {}", record.name, e),
                }
            }

            match status {
                ContainerStatus::Running => report.running += 1,
                ContainerStatus::Exited | ContainerStatus::Created => report.stopped += 1,
                _ => {}
            }
            *by_status.entry(status).or_default() += 1;
        }

        for status in [
            ContainerStatus::Created,
            ContainerStatus::Running,
            ContainerStatus::Exited,
            ContainerStatus::Paused,
            ContainerStatus::Unknown,
        ] {
            let count = by_status.get(&status).copied().unwrap_or(0);
            metrics::set_managed_containers(status.as_str(), count);
        }

        report.leftover_backups = leftover_backups(&listing);
        metrics::set_leftover_backup_containers(report.leftover_backups.len());
        for name in &report.leftover_backups {
            warn!(
                container = %name,
                "Retained backup container found; remove it once the update is verified"
            );
        }

        for stack in store.list_stacks().await? {
            match self.workflows.refresh_stack(&stack.id).await {
                Ok((record, state)) => {
                    info!(
                        stack = %record.name,
                        status = %record.status,
                        running = state.running,
                        total = state.total,
                        "Stack status refreshed"
                    );
                    report.stacks += 1;
                }
                Err(e) => warn!("Failed to refresh stack {}: {}", stack.name, e),
            }
        }

        info!(
            running = report.running,
            stopped = report.stopped,
            missing = report.missing,
            corrected = report.corrected,
            auto_started = report.auto_started,
            leftover_backups = report.leftover_backups.len(),
            stacks = report.stacks,
            stale_staging = report.stale_staging,
            "Reconciliation complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str, name: &str, status: ContainerStatus) -> ContainerSummary {
        ContainerSummary {
            engine_id: id.to_string(),
            name: name.to_string(),
            image: "nginx:1.27".to_string(),
            status,
            status_text: String::new(),
            labels: HashMap::new(),
        }
    }

    fn record(engine_id: &str, status: ContainerStatus) -> ContainerRecord {
        let mut record = ContainerRecord::new(engine_id, "web", "nginx:1.27");
        record.status = status;
        record
    }

    #[test]
    fn matching_status_needs_no_change() {
        let listing = vec![summary("abc123", "web", ContainerStatus::Running)];
        let record = record("abc123", ContainerStatus::Running);
        assert_eq!(observed_status(&record, &listing), (None, true));
    }

    #[test]
    fn short_engine_ids_match_full_ones() {
        let listing = vec![summary("abc123", "web", ContainerStatus::Exited)];
        let record = record("abc123def456", ContainerStatus::Running);
        assert_eq!(observed_status(&record, &listing), (Some(ContainerStatus::Exited), true));
    }

    #[test]
    fn vanished_container_becomes_unknown_once() {
        let running = record("gone", ContainerStatus::Running);
        assert_eq!(observed_status(&running, &[]), (Some(ContainerStatus::Unknown), false));

        let unknown = record("gone", ContainerStatus::Unknown);
        assert_eq!(observed_status(&unknown, &[]), (None, false));
    }

    #[test]
    fn only_backup_names_are_leftovers() {
        let listing = vec![
            summary("1", "web", ContainerStatus::Running),
            summary("2", "web_backup_20240501120000", ContainerStatus::Exited),
            summary("3", "web_backup_latest", ContainerStatus::Exited),
            summary("4", "db_backup_20231231235959", ContainerStatus::Exited),
        ];
        assert_eq!(
            leftover_backups(&listing),
            vec!["db_backup_20231231235959".to_string(), "web_backup_20240501120000".to_string()]
        );
    }

    #[tokio::test]
    async fn interrupted_backups_are_swept_even_without_an_engine() {
        let (state, dir) = crate::api::tests::test_state(&[]).await;
        let staging =
            stardeck_core::paths::backups_dir(dir.path()).join(".tmp-web-20240501-abc-0000");
        std::fs::create_dir_all(&staging).unwrap();

        let reconciler = StateReconciler::new(state.workflows.clone());
        assert!(reconciler.reconcile().await.is_err());
        assert!(!staging.exists());
    }
}
