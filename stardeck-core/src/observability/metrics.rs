//! Core metrics definitions.
//!
//! Names follow Prometheus conventions: `_total` for counters, `_seconds` for durations,
//! `_bytes` for sizes.

use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};

/// Register descriptions so every metric appears in `/metrics` with metadata.
pub fn register_core_metrics() {
    // Workflows
    describe_counter!("stardeck_update_total", "Container updates (by result)");
    describe_counter!(
        "stardeck_update_rollbacks_total",
        "Updates that failed after the commit point and ran compensation"
    );
    describe_histogram!(
        "stardeck_workflow_duration_seconds",
        "Duration of streamed workflows (by kind)"
    );
    describe_counter!("stardeck_stack_actions_total", "Stack compose actions (by action, result)");

    // Backups
    describe_counter!("stardeck_backup_bytes_total", "Bytes written to backup archives");

    // Engine
    describe_counter!(
        "stardeck_engine_command_failures_total",
        "Engine commands that failed (by operation)"
    );

    // Database
    describe_counter!("stardeck_db_errors_total", "Metadata store failures (by operation)");

    // Inventory
    describe_gauge!("stardeck_managed_containers", "Managed containers (by status)");
    describe_gauge!(
        "stardeck_leftover_backup_containers",
        "Renamed originals retained by past updates"
    );
}

pub fn set_managed_containers(status: &str, count: usize) {
    gauge!("stardeck_managed_containers", "status" => status.to_string()).set(count as f64);
}

pub fn set_leftover_backup_containers(count: usize) {
    gauge!("stardeck_leftover_backup_containers").set(count as f64);
}
