//! Database migrations.

use crate::error::{Result, StardeckError};
use sqlx::SqlitePool;
use tracing::{info, instrument};

const SCHEMA_VERSION: i64 = 2;

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(migration_error)?;

    let current_version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(pool)
            .await
            .map_err(migration_error)?;

    let current_version = current_version.unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    info!("Migrating database from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        migrate_to_v1(pool).await?;
    }

    if current_version < 2 {
        migrate_to_v2(pool).await?;
    }

    Ok(())
}

fn migration_error(e: sqlx::Error) -> StardeckError {
    StardeckError::MigrationFailed { reason: e.to_string() }
}

async fn execute_all(pool: &SqlitePool, statements: &[&str]) -> Result<()> {
    for statement in statements {
        sqlx::query(statement).execute(pool).await.map_err(migration_error)?;
    }
    Ok(())
}

async fn set_version(pool: &SqlitePool, version: i64) -> Result<()> {
    sqlx::query("DELETE FROM schema_version").execute(pool).await.map_err(migration_error)?;
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await
        .map_err(migration_error)?;
    Ok(())
}

/// Containers and stacks.
#[instrument(skip(pool))]
async fn migrate_to_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 1");

    execute_all(
        pool,
        &[
            r#"
            CREATE TABLE IF NOT EXISTS containers (
                id TEXT PRIMARY KEY,
                engine_id TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL,
                image TEXT NOT NULL,
                status TEXT NOT NULL,
                web_ui TEXT NOT NULL DEFAULT '{}',
                auto_start INTEGER NOT NULL DEFAULT 0,
                created_by TEXT,
                labels TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_containers_name ON containers(name)",
            r#"
            CREATE TABLE IF NOT EXISTS stacks (
                id TEXT PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                compose_content TEXT NOT NULL,
                env_content TEXT NOT NULL DEFAULT '',
                path TEXT NOT NULL,
                status TEXT NOT NULL,
                created_by TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        ],
    )
    .await?;

    set_version(pool, 1).await?;
    info!("Migration to version 1 complete");
    Ok(())
}

/// Backups and audit events.
#[instrument(skip(pool))]
async fn migrate_to_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 2");

    execute_all(
        pool,
        &[
            r#"
            CREATE TABLE IF NOT EXISTS backups (
                id TEXT PRIMARY KEY,
                container_id TEXT NOT NULL,
                backup_path TEXT UNIQUE NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_backups_container ON backups(container_id)",
            r#"
            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action TEXT NOT NULL,
                target TEXT NOT NULL,
                details TEXT NOT NULL,
                actor_id TEXT,
                actor_ip TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_audit_events_created ON audit_events(created_at)",
        ],
    )
    .await?;

    set_version(pool, 2).await?;
    info!("Migration to version 2 complete");
    Ok(())
}
