//! Per-resource operation locks.
//!
//! At most one mutating workflow runs against a given container name or stack name.
//! A second request while one is in flight is rejected with `Conflict`, not queued.

use crate::error::{Result, StardeckError};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Registry of resources that currently have a workflow in flight.
#[derive(Debug, Clone, Default)]
pub struct OperationLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

/// Releases its key when dropped.
#[derive(Debug)]
pub struct OperationGuard {
    key: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl OperationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock a container by name.
    pub fn container(&self, name: &str) -> Result<OperationGuard> {
        self.acquire(format!("container:{}", name), "container", name)
    }

    /// Lock a stack by name.
    pub fn stack(&self, name: &str) -> Result<OperationGuard> {
        self.acquire(format!("stack:{}", name), "stack", name)
    }

    pub fn is_locked_container(&self, name: &str) -> bool {
        self.held.lock().map(|h| h.contains(&format!("container:{}", name))).unwrap_or(false)
    }

    fn acquire(&self, key: String, kind: &str, name: &str) -> Result<OperationGuard> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| StardeckError::Internal("operation lock poisoned".to_string()))?;
        if !held.insert(key.clone()) {
            return Err(StardeckError::conflict(format!(
                "another operation is already in progress for {} '{}'",
                kind, name
            )));
        }
        debug!(key = %key, "operation lock acquired");
        Ok(OperationGuard { key, held: Arc::clone(&self.held) })
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.key);
        }
        debug!(key = %self.key, "operation lock released");
    }
}
