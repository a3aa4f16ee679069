//! Metadata store interface.
//!
//! Records are owned by the store. Workflows hold them only for the duration of one
//! operation and re-read them on every call.

use crate::error::{Result, StardeckError};
use crate::types::{
    BackupRecord, ContainerRecord, ContainerStatus, StackRecord, StackStatus, WebUi,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Partial update of the user-editable parts of a container record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerMetadataUpdate {
    pub web_ui: Option<WebUi>,
    pub auto_start: Option<bool>,
    pub labels: Option<HashMap<String, String>>,
}

/// Persistent store for container, stack and backup records.
///
/// Writes to one record are last-writer-wins.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fails with `Conflict` if another record already holds the engine id.
    async fn insert_container(&self, record: &ContainerRecord) -> Result<()>;

    async fn get_container(&self, id: &str) -> Result<ContainerRecord>;

    async fn find_container_by_engine_id(&self, engine_id: &str)
        -> Result<Option<ContainerRecord>>;

    async fn find_container_by_name(&self, name: &str) -> Result<Option<ContainerRecord>>;

    async fn list_containers(&self) -> Result<Vec<ContainerRecord>>;

    /// Point a record at a (possibly new) engine container.
    async fn update_container_engine_state(
        &self,
        id: &str,
        engine_id: &str,
        image: &str,
        status: ContainerStatus,
    ) -> Result<()>;

    async fn update_container_status(&self, id: &str, status: ContainerStatus) -> Result<()>;

    async fn update_container_metadata(
        &self,
        id: &str,
        update: &ContainerMetadataUpdate,
    ) -> Result<ContainerRecord>;

    async fn delete_container(&self, id: &str) -> Result<()>;

    /// Fails with `Conflict` if the stack name is taken.
    async fn insert_stack(&self, record: &StackRecord) -> Result<()>;

    async fn get_stack(&self, id: &str) -> Result<StackRecord>;

    async fn get_stack_by_name(&self, name: &str) -> Result<Option<StackRecord>>;

    async fn list_stacks(&self) -> Result<Vec<StackRecord>>;

    async fn update_stack_status(&self, id: &str, status: StackStatus) -> Result<()>;

    async fn update_stack_content(
        &self,
        id: &str,
        compose_content: &str,
        env_content: &str,
        path: &str,
    ) -> Result<()>;

    async fn delete_stack(&self, id: &str) -> Result<()>;

    async fn insert_backup(&self, record: &BackupRecord) -> Result<()>;

    async fn get_backup(&self, id: &str) -> Result<BackupRecord>;

    /// All backups, or only those of one container record.
    async fn list_backups(&self, container_id: Option<&str>) -> Result<Vec<BackupRecord>>;

    async fn find_backup_by_path(&self, path: &str) -> Result<Option<BackupRecord>>;

    async fn delete_backup(&self, id: &str) -> Result<()>;
}

/// Resolve a container record by record id, engine id or name, in that order.
pub async fn resolve_container(store: &dyn MetadataStore, key: &str) -> Result<ContainerRecord> {
    match store.get_container(key).await {
        Ok(record) => return Ok(record),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }
    if let Some(record) = store.find_container_by_engine_id(key).await? {
        return Ok(record);
    }
    store
        .find_container_by_name(key)
        .await?
        .ok_or_else(|| StardeckError::not_found("container", key))
}

/// Resolve a stack record by id or name.
pub async fn resolve_stack(store: &dyn MetadataStore, key: &str) -> Result<StackRecord> {
    match store.get_stack(key).await {
        Ok(record) => return Ok(record),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }
    store.get_stack_by_name(key).await?.ok_or_else(|| StardeckError::not_found("stack", key))
}
