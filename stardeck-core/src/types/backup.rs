//! Backup domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A completed filesystem backup of a container's bind mounts.
///
/// Immutable once created. Only the backup manager creates these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub id: String,
    /// Owning container record id
    pub container_id: String,
    pub backup_path: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Manifest written next to the archives of a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub container_name: String,
    pub container_id: String,
    pub engine_id: String,
    pub image: String,
    pub created_at: DateTime<Utc>,
    pub mounts: Vec<BackupMountEntry>,
    /// Sum of archive sizes
    pub size_bytes: u64,
}

/// One archived bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMountEntry {
    pub source: String,
    pub destination: String,
    pub read_only: bool,
    /// Archive file name relative to the backup directory
    pub archive: String,
    pub size_bytes: u64,
}
