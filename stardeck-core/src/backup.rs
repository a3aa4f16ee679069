//! Filesystem backups of container bind mounts.
//!
//! Each backup is one directory under the backup root:
//!
//! ```text
//! backups/<container>-<YYYYMMDD>-<hash>/
//!     mount-0.tar.gz
//!     mount-1.tar.gz
//!     manifest.json
//! ```
//!
//! Archives are written into a hidden staging directory and moved into place only once
//! every mount archived successfully. The `BackupRecord` is inserted last, so a failed
//! backup never appears as complete.

use crate::error::{Result, StardeckError};
use crate::paths;
use crate::progress::{ProgressReporter, Step};
use crate::store::MetadataStore;
use crate::types::{
    BackupManifest, BackupMountEntry, BackupRecord, ContainerDetails, ContainerRecord, Mount,
};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

/// Progress message from the archiving thread.
struct ArchiveProgress {
    index: usize,
    total: usize,
    source: String,
}

/// Manager for container backups.
#[derive(Clone)]
pub struct BackupManager {
    store: Arc<dyn MetadataStore>,
    root: PathBuf,
}

impl BackupManager {
    pub fn new(store: Arc<dyn MetadataStore>, root: PathBuf) -> Self {
        Self { store, root }
    }

    /// Get the backup root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Derived directory name: `<container>-<YYYYMMDD>-<12 hex digits>`.
    ///
    /// The hash covers the container name and its sorted bind mounts, so the same
    /// container backed up twice on one day collides unless its mounts changed.
    pub fn derived_name(container: &str, mounts: &[&Mount], at: DateTime<Utc>) -> String {
        let mut keys: Vec<String> =
            mounts.iter().map(|m| format!("{}:{}", m.source, m.destination)).collect();
        keys.sort();

        let mut hasher = Sha256::new();
        hasher.update(container.as_bytes());
        for key in &keys {
            hasher.update(b"\n");
            hasher.update(key.as_bytes());
        }
        let digest = hasher.finalize();
        let hash: String = digest.iter().take(6).map(|b| format!("{:02x}", b)).collect();

        format!("{}-{}-{}", sanitize(container), at.format("%Y%m%d"), hash)
    }

    /// Archive every bind mount of a container.
    ///
    /// Fails with `ValidationFailed` if the container has no bind mounts and with
    /// `Conflict` if a backup with the same derived name exists and `overwrite` is false.
    #[instrument(skip(self, record, details, progress), fields(container = %details.name))]
    pub async fn create(
        &self,
        record: &ContainerRecord,
        details: &ContainerDetails,
        overwrite: bool,
        progress: &ProgressReporter,
    ) -> Result<BackupRecord> {
        let mounts: Vec<Mount> = details.spec.bind_mounts().cloned().collect();
        if mounts.is_empty() {
            return Err(StardeckError::validation(format!(
                "container {} has no bind mounts to back up",
                details.name
            )));
        }

        let now = Utc::now();
        let mount_refs: Vec<&Mount> = mounts.iter().collect();
        let derived = Self::derived_name(&details.name, &mount_refs, now);
        let final_dir = self.root.join(&derived);
        let final_path = final_dir.to_string_lossy().to_string();

        let existing = self.store.find_backup_by_path(&final_path).await?;
        let collision = existing.is_some() || fs::metadata(&final_dir).await.is_ok();
        if collision && !overwrite {
            return Err(StardeckError::conflict(format!(
                "backup {} already exists; request overwrite to replace it",
                derived
            )));
        }

        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StardeckError::IoError { path: self.root.clone(), source: e })?;

        let staging = self.root.join(format!(".tmp-{}-{}", derived, uuid::Uuid::new_v4()));
        fs::create_dir_all(&staging)
            .await
            .map_err(|e| StardeckError::IoError { path: staging.clone(), source: e })?;

        info!(backup = %derived, mounts = mounts.len(), "Creating backup");

        let entries = match self.archive_mounts(&mounts, &staging, progress).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(backup = %derived, error = %e, "Backup failed; removing staging directory");
                let _ = fs::remove_dir_all(&staging).await;
                return Err(e);
            }
        };

        let size_bytes: u64 = entries.iter().map(|e| e.size_bytes).sum();
        let manifest = BackupManifest {
            container_name: details.name.clone(),
            container_id: record.id.clone(),
            engine_id: details.engine_id.clone(),
            image: details.spec.image.clone(),
            created_at: now,
            mounts: entries,
            size_bytes,
        };
        if let Err(e) = write_manifest(&staging, &manifest).await {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(e);
        }

        // Only now is the old backup replaced.
        if collision {
            if let Some(old) = &existing {
                self.store.delete_backup(&old.id).await?;
            }
            if let Err(e) = fs::remove_dir_all(&final_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    let _ = fs::remove_dir_all(&staging).await;
                    return Err(StardeckError::IoError { path: final_dir, source: e });
                }
            }
        }

        if let Err(e) = fs::rename(&staging, &final_dir).await {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(StardeckError::IoError { path: final_dir, source: e });
        }

        let backup = BackupRecord {
            id: uuid::Uuid::new_v4().to_string(),
            container_id: record.id.clone(),
            backup_path: final_path,
            size_bytes,
            created_at: now,
        };
        if let Err(e) = self.store.insert_backup(&backup).await {
            let _ = fs::remove_dir_all(&final_dir).await;
            return Err(e);
        }

        metrics::counter!("stardeck_backup_bytes_total").increment(size_bytes);
        info!(backup_id = %backup.id, size_bytes, "Backup created successfully");
        Ok(backup)
    }

    /// Archive mounts on a blocking thread, relaying its progress as it goes.
    async fn archive_mounts(
        &self,
        mounts: &[Mount],
        staging: &Path,
        progress: &ProgressReporter,
    ) -> Result<Vec<BackupMountEntry>> {
        let (tx, mut rx) = mpsc::channel::<ArchiveProgress>(16);
        let mounts = mounts.to_vec();
        let staging = staging.to_path_buf();

        let worker = tokio::task::spawn_blocking(move || -> Result<Vec<BackupMountEntry>> {
            let total = mounts.len();
            let mut entries = Vec::with_capacity(total);
            for (index, mount) in mounts.iter().enumerate() {
                let _ = tx.blocking_send(ArchiveProgress {
                    index,
                    total,
                    source: mount.source.clone(),
                });
                let archive = format!("mount-{}.tar.gz", index);
                let size_bytes = archive_path(Path::new(&mount.source), &staging.join(&archive))?;
                entries.push(BackupMountEntry {
                    source: mount.source.clone(),
                    destination: mount.destination.clone(),
                    read_only: mount.read_only,
                    archive,
                    size_bytes,
                });
            }
            Ok(entries)
        });

        while let Some(msg) = rx.recv().await {
            let percent = (msg.index * 100 / msg.total.max(1)) as u8;
            progress
                .progress(
                    Step::Backup,
                    format!("Archiving {} ({}/{})", msg.source, msg.index + 1, msg.total),
                    percent,
                )
                .await;
        }

        let entries = worker
            .await
            .map_err(|e| StardeckError::Internal(format!("backup task failed: {}", e)))??;
        progress.progress(Step::Backup, "Archives written", 100).await;
        Ok(entries)
    }

    /// List backups, optionally only those of one container record.
    #[instrument(skip(self))]
    pub async fn list(&self, container_id: Option<&str>) -> Result<Vec<BackupRecord>> {
        self.store.list_backups(container_id).await
    }

    #[instrument(skip(self))]
    pub async fn get(&self, backup_id: &str) -> Result<BackupRecord> {
        self.store.get_backup(backup_id).await
    }

    /// Read a backup's manifest from disk.
    #[instrument(skip(self))]
    pub async fn manifest(&self, backup_id: &str) -> Result<BackupManifest> {
        let backup = self.store.get_backup(backup_id).await?;
        let path = Path::new(&backup.backup_path).join(paths::BACKUP_MANIFEST);
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| StardeckError::IoError { path: path.clone(), source: e })?;
        serde_json::from_str(&content)
            .map_err(|e| StardeckError::Internal(format!("Failed to parse manifest: {}", e)))
    }

    /// Delete a backup's directory and its record.
    #[instrument(skip(self))]
    pub async fn delete(&self, backup_id: &str) -> Result<()> {
        let backup = self.store.get_backup(backup_id).await?;
        let path = PathBuf::from(&backup.backup_path);
        match fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(backup_id, "Backup directory already gone");
            }
            Err(e) => return Err(StardeckError::IoError { path, source: e }),
        }
        self.store.delete_backup(backup_id).await?;
        info!(backup_id, "Backup deleted");
        Ok(())
    }

    /// Remove staging directories left by backups that never finished.
    ///
    /// Only safe while no backup is running.
    pub async fn sweep_staging(&self) -> Result<usize> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StardeckError::IoError { path: self.root.clone(), source: e }),
        };
        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StardeckError::IoError { path: self.root.clone(), source: e })?
        {
            if !entry.file_name().to_string_lossy().starts_with(".tmp-") {
                continue;
            }
            let path = entry.path();
            match fs::remove_dir_all(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), "Failed to remove stale staging directory: {}", e),
            }
        }
        if removed > 0 {
            info!(removed, "Removed stale backup staging directories");
        }
        Ok(removed)
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

async fn write_manifest(dir: &Path, manifest: &BackupManifest) -> Result<()> {
    let path = dir.join(paths::BACKUP_MANIFEST);
    let json = serde_json::to_string_pretty(manifest)
        .map_err(|e| StardeckError::Internal(format!("Failed to serialize manifest: {}", e)))?;
    fs::write(&path, json).await.map_err(|e| StardeckError::IoError { path, source: e })
}

/// Write `source` (directory or file) as a gzipped tarball. Returns the archive size.
fn archive_path(source: &Path, archive: &Path) -> Result<u64> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |e: std::io::Error| StardeckError::IoError { path, source: e }
    };

    let meta = std::fs::metadata(source).map_err(io_err(source))?;
    let file = std::fs::File::create(archive).map_err(io_err(archive))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);

    if meta.is_dir() {
        builder.append_dir_all(".", source).map_err(io_err(source))?;
    } else {
        let name = source.file_name().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("data"));
        builder.append_path_with_name(source, name).map_err(io_err(source))?;
    }

    let encoder = builder.into_inner().map_err(io_err(archive))?;
    let file = encoder.finish().map_err(io_err(archive))?;
    file.sync_all().map_err(io_err(archive))?;
    Ok(file.metadata().map_err(io_err(archive))?.len())
}
