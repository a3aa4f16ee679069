//! State management with SQLite persistence.
//!
//! The StateManager handles all persistent state for Stardeck:
//! - Container records (one per live engine id)
//! - Stack records (Compose deployments)
//! - Backup records
//! - Audit events

use crate::audit::{self, AuditEvent, AuditSink};
use crate::error::{Result, StardeckError};
use crate::store::{ContainerMetadataUpdate, MetadataStore};
use crate::types::{BackupRecord, ContainerRecord, ContainerStatus, StackRecord, StackStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row};
use std::path::Path;
use std::str::FromStr;
use tracing::{info, instrument};

pub mod migrations;

#[cfg(test)]
mod tests;

/// State manager for persistent storage.
#[derive(Clone)]
pub struct StateManager {
    pool: SqlitePool,
}

impl StateManager {
    /// Create a new StateManager with an in-memory database (for tests).
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(":memory:").await
    }

    /// Get a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a new StateManager with a database at the specified path.
    #[instrument(skip(db_path))]
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Initializing state manager at {:?}", db_path);

        let in_memory = db_path == Path::new(":memory:");
        if !in_memory {
            if let Some(parent) = db_path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| StardeckError::IoError {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        let mut options = SqliteConnectOptions::from_str(db_path.to_str().ok_or_else(|| {
            StardeckError::InvalidConfig { reason: "Invalid database path".to_string() }
        })?)
        .map_err(db_error)?;

        options = options.create_if_missing(true).log_statements(tracing::log::LevelFilter::Debug);

        // Every in-memory connection is its own database, so keep exactly one alive.
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await
        } else {
            SqlitePoolOptions::new().max_connections(5).connect_with(options).await
        }
        .map_err(db_error)?;

        let manager = Self { pool };
        manager.run_migrations().await?;

        info!("State manager initialized successfully");
        Ok(manager)
    }

    #[instrument(skip(self))]
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        migrations::run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    /// Cheap liveness query for health checks.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(db_error)?;
        Ok(())
    }

    /// Most recent audit events, newest first.
    #[instrument(skip(self))]
    pub async fn list_audit_events(&self, limit: i64) -> Result<Vec<AuditEvent>> {
        let rows = sqlx::query("SELECT * FROM audit_events ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        rows.into_iter()
            .map(|row| {
                let details: String = row.get("details");
                Ok(AuditEvent {
                    action: row.get("action"),
                    target: row.get("target"),
                    details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
                    actor_id: row.get("actor_id"),
                    actor_ip: row.get("actor_ip"),
                    timestamp: from_epoch(row.get("created_at")),
                })
            })
            .collect()
    }

    fn row_to_container(&self, row: SqliteRow) -> Result<ContainerRecord> {
        let web_ui: String = row.get("web_ui");
        let labels: String = row.get("labels");
        let status: String = row.get("status");

        Ok(ContainerRecord {
            id: row.get("id"),
            engine_id: row.get("engine_id"),
            name: row.get("name"),
            image: row.get("image"),
            status: ContainerStatus::from_engine(&status),
            web_ui: serde_json::from_str(&web_ui).map_err(|e| {
                StardeckError::DatabaseError(format!("Failed to deserialize web_ui: {}", e))
            })?,
            auto_start: row.get::<i64, _>("auto_start") != 0,
            created_by: row.get("created_by"),
            labels: serde_json::from_str(&labels).map_err(|e| {
                StardeckError::DatabaseError(format!("Failed to deserialize labels: {}", e))
            })?,
            created_at: from_epoch(row.get("created_at")),
            updated_at: from_epoch(row.get("updated_at")),
        })
    }

    fn row_to_stack(&self, row: SqliteRow) -> Result<StackRecord> {
        let status: String = row.get("status");
        Ok(StackRecord {
            id: row.get("id"),
            name: row.get("name"),
            compose_content: row.get("compose_content"),
            env_content: row.get("env_content"),
            path: row.get("path"),
            status: StackStatus::parse(&status).unwrap_or(StackStatus::Error),
            created_by: row.get("created_by"),
            created_at: from_epoch(row.get("created_at")),
            updated_at: from_epoch(row.get("updated_at")),
        })
    }

    fn row_to_backup(&self, row: SqliteRow) -> Result<BackupRecord> {
        Ok(BackupRecord {
            id: row.get("id"),
            container_id: row.get("container_id"),
            backup_path: row.get("backup_path"),
            size_bytes: row.get::<i64, _>("size_bytes").max(0) as u64,
            created_at: from_epoch(row.get("created_at")),
        })
    }
}

fn db_error(e: sqlx::Error) -> StardeckError {
    StardeckError::DatabaseError(e.to_string())
}

/// Map a write error, turning UNIQUE violations into `Conflict`.
fn write_error(operation: &'static str, e: sqlx::Error) -> StardeckError {
    metrics::counter!("stardeck_db_errors_total", "operation" => operation).increment(1);
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StardeckError::conflict(format!("{}: {}", operation, db.message()))
        }
        _ => db_error(e),
    }
}

fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| StardeckError::DatabaseError(format!("Failed to serialize {}: {}", what, e)))
}

fn require_row(affected: u64, kind: &'static str, id: &str) -> Result<()> {
    if affected == 0 {
        Err(StardeckError::not_found(kind, id))
    } else {
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for StateManager {
    // ========================
    // Container Operations
    // ========================

    #[instrument(skip(self, record), fields(container = %record.name, engine_id = %record.engine_id))]
    async fn insert_container(&self, record: &ContainerRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO containers (id, engine_id, name, image, status, web_ui, auto_start,
                                    created_by, labels, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.engine_id)
        .bind(&record.name)
        .bind(&record.image)
        .bind(record.status.as_str())
        .bind(to_json(&record.web_ui, "web_ui")?)
        .bind(record.auto_start as i64)
        .bind(&record.created_by)
        .bind(to_json(&record.labels, "labels")?)
        .bind(record.created_at.timestamp())
        .bind(record.updated_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("insert_container", e))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_container(&self, id: &str) -> Result<ContainerRecord> {
        let row = sqlx::query("SELECT * FROM containers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| StardeckError::not_found("container", id))?;

        self.row_to_container(row)
    }

    #[instrument(skip(self))]
    async fn find_container_by_engine_id(
        &self,
        engine_id: &str,
    ) -> Result<Option<ContainerRecord>> {
        // Accept short ids the way the engine does.
        let pattern = format!("{}%", engine_id);
        let rows = sqlx::query("SELECT * FROM containers WHERE engine_id = ? OR engine_id LIKE ?")
            .bind(engine_id)
            .bind(&pattern)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        match rows.len() {
            0 => Ok(None),
            1 => rows.into_iter().next().map(|row| self.row_to_container(row)).transpose(),
            n => Err(StardeckError::validation(format!(
                "Ambiguous engine id '{}': matches {} containers",
                engine_id, n
            ))),
        }
    }

    #[instrument(skip(self))]
    async fn find_container_by_name(&self, name: &str) -> Result<Option<ContainerRecord>> {
        sqlx::query("SELECT * FROM containers WHERE name = ? ORDER BY updated_at DESC LIMIT 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(|row| self.row_to_container(row))
            .transpose()
    }

    #[instrument(skip(self))]
    async fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        let rows = sqlx::query("SELECT * FROM containers ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        rows.into_iter().map(|row| self.row_to_container(row)).collect()
    }

    #[instrument(skip(self))]
    async fn update_container_engine_state(
        &self,
        id: &str,
        engine_id: &str,
        image: &str,
        status: ContainerStatus,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE containers SET engine_id = ?, image = ?, status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(engine_id)
        .bind(image)
        .bind(status.as_str())
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("update_container_engine_state", e))?;

        require_row(result.rows_affected(), "container", id)
    }

    #[instrument(skip(self))]
    async fn update_container_status(&self, id: &str, status: ContainerStatus) -> Result<()> {
        let result = sqlx::query("UPDATE containers SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error("update_container_status", e))?;

        require_row(result.rows_affected(), "container", id)
    }

    #[instrument(skip(self, update))]
    async fn update_container_metadata(
        &self,
        id: &str,
        update: &ContainerMetadataUpdate,
    ) -> Result<ContainerRecord> {
        let mut record = self.get_container(id).await?;
        if let Some(web_ui) = &update.web_ui {
            record.web_ui = web_ui.clone();
        }
        if let Some(auto_start) = update.auto_start {
            record.auto_start = auto_start;
        }
        if let Some(labels) = &update.labels {
            record.labels = labels.clone();
        }
        record.updated_at = Utc::now();

        sqlx::query(
            "UPDATE containers SET web_ui = ?, auto_start = ?, labels = ?, updated_at = ? WHERE id = ?",
        )
        .bind(to_json(&record.web_ui, "web_ui")?)
        .bind(record.auto_start as i64)
        .bind(to_json(&record.labels, "labels")?)
        .bind(record.updated_at.timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("update_container_metadata", e))?;

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn delete_container(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM containers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error("delete_container", e))?;

        require_row(result.rows_affected(), "container", id)
    }

    // ========================
    // Stack Operations
    // ========================

    #[instrument(skip(self, record), fields(stack = %record.name))]
    async fn insert_stack(&self, record: &StackRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stacks (id, name, compose_content, env_content, path, status,
                                created_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.compose_content)
        .bind(&record.env_content)
        .bind(&record.path)
        .bind(record.status.as_str())
        .bind(&record.created_by)
        .bind(record.created_at.timestamp())
        .bind(record.updated_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("insert_stack", e))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_stack(&self, id: &str) -> Result<StackRecord> {
        let row = sqlx::query("SELECT * FROM stacks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| StardeckError::not_found("stack", id))?;

        self.row_to_stack(row)
    }

    #[instrument(skip(self))]
    async fn get_stack_by_name(&self, name: &str) -> Result<Option<StackRecord>> {
        sqlx::query("SELECT * FROM stacks WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(|row| self.row_to_stack(row))
            .transpose()
    }

    #[instrument(skip(self))]
    async fn list_stacks(&self) -> Result<Vec<StackRecord>> {
        let rows = sqlx::query("SELECT * FROM stacks ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        rows.into_iter().map(|row| self.row_to_stack(row)).collect()
    }

    #[instrument(skip(self))]
    async fn update_stack_status(&self, id: &str, status: StackStatus) -> Result<()> {
        let result = sqlx::query("UPDATE stacks SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error("update_stack_status", e))?;

        require_row(result.rows_affected(), "stack", id)
    }

    #[instrument(skip(self, compose_content, env_content))]
    async fn update_stack_content(
        &self,
        id: &str,
        compose_content: &str,
        env_content: &str,
        path: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE stacks SET compose_content = ?, env_content = ?, path = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(compose_content)
        .bind(env_content)
        .bind(path)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("update_stack_content", e))?;

        require_row(result.rows_affected(), "stack", id)
    }

    #[instrument(skip(self))]
    async fn delete_stack(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM stacks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error("delete_stack", e))?;

        require_row(result.rows_affected(), "stack", id)
    }

    // ========================
    // Backup Operations
    // ========================

    #[instrument(skip(self, record), fields(backup_id = %record.id))]
    async fn insert_backup(&self, record: &BackupRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backups (id, container_id, backup_path, size_bytes, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.container_id)
        .bind(&record.backup_path)
        .bind(record.size_bytes as i64)
        .bind(record.created_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("insert_backup", e))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_backup(&self, id: &str) -> Result<BackupRecord> {
        let row = sqlx::query("SELECT * FROM backups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| StardeckError::not_found("backup", id))?;

        self.row_to_backup(row)
    }

    #[instrument(skip(self))]
    async fn list_backups(&self, container_id: Option<&str>) -> Result<Vec<BackupRecord>> {
        let rows = match container_id {
            Some(container_id) => {
                sqlx::query(
                    "SELECT * FROM backups WHERE container_id = ? ORDER BY created_at DESC, id",
                )
                .bind(container_id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM backups ORDER BY created_at DESC, id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(db_error)?;

        rows.into_iter().map(|row| self.row_to_backup(row)).collect()
    }

    #[instrument(skip(self))]
    async fn find_backup_by_path(&self, path: &str) -> Result<Option<BackupRecord>> {
        sqlx::query("SELECT * FROM backups WHERE backup_path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(|row| self.row_to_backup(row))
            .transpose()
    }

    #[instrument(skip(self))]
    async fn delete_backup(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM backups WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error("delete_backup", e))?;

        require_row(result.rows_affected(), "backup", id)
    }
}

#[async_trait]
impl AuditSink for StateManager {
    #[instrument(skip(self, event), fields(action = %event.action))]
    async fn record(&self, event: AuditEvent) -> Result<()> {
        audit::log_event(&event);
        sqlx::query(
            r#"
            INSERT INTO audit_events (action, target, details, actor_id, actor_ip, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.action)
        .bind(&event.target)
        .bind(event.details.to_string())
        .bind(&event.actor_id)
        .bind(&event.actor_ip)
        .bind(event.timestamp.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("insert_audit_event", e))?;

        Ok(())
    }
}
