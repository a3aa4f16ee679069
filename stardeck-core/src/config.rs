//! Configuration management.

use crate::error::{Result, StardeckError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persistent configuration for Stardeck.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub metrics_port: u16,
    pub log_level: String,
    pub data_dir: String,
    /// Container engine CLI to drive (`docker`, `podman`, or an absolute path).
    pub engine_binary: String,
    pub engine_timeouts: EngineTimeouts,
    pub default_stop_timeout_secs: u64,
    /// Upper bound on a single supervised workflow.
    pub workflow_timeout_secs: u64,
    /// How long shutdown waits for in-flight workflows.
    pub shutdown_grace_secs: u64,
    /// Capacity of each progress queue between a workflow and its transport.
    pub progress_buffer: usize,
    /// How long a workflow waits on a full progress queue before dropping an event.
    pub progress_send_timeout_ms: u64,
    /// Bearer token -> user id.
    pub api_tokens: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:41100".to_string(),
            metrics_port: 41102,
            log_level: "info".to_string(),
            data_dir: paths::data_dir().to_string_lossy().to_string(),
            engine_binary: "docker".to_string(),
            engine_timeouts: EngineTimeouts::default(),
            default_stop_timeout_secs: 30,
            workflow_timeout_secs: 3600,
            shutdown_grace_secs: 300,
            progress_buffer: 64,
            progress_send_timeout_ms: 5000,
            api_tokens: HashMap::new(),
        }
    }
}

/// Per-operation bounds for engine calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineTimeouts {
    /// List/inspect calls.
    pub inspect_secs: u64,
    /// Start/stop/rename/remove and similar mutations.
    pub mutate_secs: u64,
    pub create_secs: u64,
    pub pull_secs: u64,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self { inspect_secs: 5, mutate_secs: 30, create_secs: 120, pull_secs: 600 }
    }
}

impl EngineTimeouts {
    pub fn inspect(&self) -> Duration {
        Duration::from_secs(self.inspect_secs)
    }

    pub fn mutate(&self) -> Duration {
        Duration::from_secs(self.mutate_secs)
    }

    pub fn create(&self) -> Duration {
        Duration::from_secs(self.create_secs)
    }

    pub fn pull(&self) -> Duration {
        Duration::from_secs(self.pull_secs)
    }
}

impl Config {
    /// Get the default path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_dir().join("config.json")
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a file, falling back to defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| StardeckError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|e| {
            StardeckError::InvalidConfig { reason: format!("Failed to parse config: {}", e) }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StardeckError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            StardeckError::InvalidConfig { reason: format!("Failed to serialize config: {}", e) }
        })?;
        std::fs::write(path, content)
            .map_err(|e| StardeckError::IoError { path: path.to_path_buf(), source: e })
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine_binary.trim().is_empty() {
            return Err(StardeckError::InvalidConfig {
                reason: "engine_binary must not be empty".to_string(),
            });
        }
        if self.progress_buffer == 0 {
            return Err(StardeckError::InvalidConfig {
                reason: "progress_buffer must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn default_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.default_stop_timeout_secs)
    }

    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn progress_send_timeout(&self) -> Duration {
        Duration::from_millis(self.progress_send_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.engine_binary, "docker");
        assert_eq!(config.engine_timeouts.inspect_secs, 5);
        assert_eq!(config.default_stop_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"engine_binary": "podman", "engine_timeouts": {"pull_secs": 60}}"#)
            .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.engine_binary, "podman");
        assert_eq!(config.engine_timeouts.pull_secs, 60);
        assert_eq!(config.engine_timeouts.create_secs, 120);
    }

    #[test]
    fn zero_progress_buffer_is_rejected() {
        let config = Config { progress_buffer: 0, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = Config::default();
        config.api_tokens.insert("secret".to_string(), "admin".to_string());
        config.save(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.api_tokens.get("secret").map(String::as_str), Some("admin"));
    }
}
