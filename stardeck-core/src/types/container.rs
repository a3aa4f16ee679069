//! Container domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A managed container as persisted in the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    /// Stardeck-assigned identifier (UUID v4)
    pub id: String,

    /// Engine-assigned identifier; changes across an update
    pub engine_id: String,

    pub name: String,

    pub image: String,

    pub status: ContainerStatus,

    pub web_ui: WebUi,

    /// Start the container when the daemon starts
    pub auto_start: bool,

    /// User id of the creator
    pub created_by: Option<String>,

    pub labels: HashMap<String, String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ContainerRecord {
    /// Create a fresh record for a container the engine already knows about.
    pub fn new(
        engine_id: impl Into<String>,
        name: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            engine_id: engine_id.into(),
            name: name.into(),
            image: image.into(),
            status: ContainerStatus::Created,
            web_ui: WebUi::default(),
            auto_start: false,
            created_by: None,
            labels: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Web UI shortcut shown next to a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebUi {
    pub enabled: bool,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub icon: Option<String>,
}

/// Container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Exited,
    Paused,
    Unknown,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Paused => "paused",
            Self::Unknown => "unknown",
        }
    }

    /// Parse an engine state string (`running`, `exited`, `restarting`, ...).
    pub fn from_engine(state: &str) -> Self {
        match state.trim().to_lowercase().as_str() {
            "created" => Self::Created,
            "running" | "restarting" => Self::Running,
            "exited" | "dead" => Self::Exited,
            "paused" => Self::Paused,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mount type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    /// Host path mapped into the container
    Bind,
    /// Engine-managed named volume
    Volume,
    Tmpfs,
}

impl MountType {
    pub fn from_engine(kind: &str) -> Option<Self> {
        match kind {
            "bind" => Some(Self::Bind),
            "volume" => Some(Self::Volume),
            "tmpfs" => Some(Self::Tmpfs),
            _ => None,
        }
    }
}

/// A mount on a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub kind: MountType,
    /// Host path for binds, volume name for volumes, empty for tmpfs
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    pub fn bind(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            kind: MountType::Bind,
            source: source.into(),
            destination: destination.into(),
            read_only: false,
        }
    }

    pub fn is_bind(&self) -> bool {
        self.kind == MountType::Bind
    }
}

/// Transport protocol for a published port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// A published container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortBinding {
    pub host_ip: Option<String>,
    /// `None` lets the engine pick a host port
    pub host_port: Option<u16>,
    pub container_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Restart policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    UnlessStopped,
    OnFailure {
        #[serde(default)]
        max_retries: u32,
    },
}

impl RestartPolicy {
    /// Parse the engine's `RestartPolicy` name and retry count.
    pub fn from_engine(name: &str, max_retries: u32) -> Self {
        match name {
            "always" => Self::Always,
            "unless-stopped" => Self::UnlessStopped,
            "on-failure" => Self::OnFailure { max_retries },
            _ => Self::No,
        }
    }

    /// The `--restart` argument value.
    pub fn to_arg(&self) -> String {
        match self {
            Self::No => "no".to_string(),
            Self::Always => "always".to_string(),
            Self::UnlessStopped => "unless-stopped".to_string(),
            Self::OnFailure { max_retries: 0 } => "on-failure".to_string(),
            Self::OnFailure { max_retries } => format!("on-failure:{}", max_retries),
        }
    }
}

/// Resource limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub memory_bytes: Option<i64>,
    /// CPU quota in units of 1e-9 CPUs
    pub nano_cpus: Option<i64>,
    pub cpu_shares: Option<i64>,
}

/// The recreatable configuration of a container.
///
/// Everything the update workflow needs to create an equivalent container from a new image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    /// `KEY=VALUE` entries, order preserved
    pub env: Vec<String>,
    pub ports: Vec<PortBinding>,
    pub mounts: Vec<Mount>,
    pub restart_policy: RestartPolicy,
    pub network_mode: Option<String>,
    pub resources: ResourceLimits,
    pub labels: BTreeMap<String, String>,
    pub hostname: Option<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub extra_hosts: Vec<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self { name: name.into(), image: image.into(), ..Default::default() }
    }

    /// Bind mounts only.
    pub fn bind_mounts(&self) -> impl Iterator<Item = &Mount> {
        self.mounts.iter().filter(|m| m.is_bind())
    }

    /// Drop env entries, labels and command that the container merely inherited from its image.
    ///
    /// Recreating from a new image must let that image's own defaults apply.
    pub fn strip_image_defaults(&mut self, image: &ImageDetails) {
        self.env.retain(|entry| !image.env.contains(entry));
        self.labels.retain(|k, v| image.labels.get(k) != Some(v));
        if !image.cmd.is_empty() && self.command == image.cmd {
            self.command.clear();
        }
        if let Some(entrypoint) = &self.entrypoint {
            if Some(entrypoint) == image.entrypoint.as_ref() {
                self.entrypoint = None;
            }
        }
    }
}

/// Full inspect result for a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDetails {
    pub engine_id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub running: bool,
    /// Id of the image the container was created from
    pub image_id: String,
    pub created: Option<String>,
    pub spec: ContainerSpec,
}

/// Row from a container listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub engine_id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    /// Human readable status, e.g. "Up 2 hours"
    pub status_text: String,
    pub labels: HashMap<String, String>,
}

/// Image inspect result (the subset needed to reason about defaults).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDetails {
    pub id: String,
    pub tags: Vec<String>,
    pub size_bytes: u64,
    pub created: Option<String>,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub cmd: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
}

/// Point-in-time resource usage for one container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub engine_id: String,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub pids: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_states_map_to_status() {
        assert_eq!(ContainerStatus::from_engine("running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::from_engine("restarting"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::from_engine("Exited"), ContainerStatus::Exited);
        assert_eq!(ContainerStatus::from_engine("dead"), ContainerStatus::Exited);
        assert_eq!(ContainerStatus::from_engine("removing"), ContainerStatus::Unknown);
    }

    #[test]
    fn restart_policy_args() {
        assert_eq!(RestartPolicy::from_engine("on-failure", 3).to_arg(), "on-failure:3");
        assert_eq!(RestartPolicy::from_engine("on-failure", 0).to_arg(), "on-failure");
        assert_eq!(RestartPolicy::from_engine("", 0), RestartPolicy::No);
        assert_eq!(RestartPolicy::UnlessStopped.to_arg(), "unless-stopped");
    }

    #[test]
    fn strip_image_defaults_keeps_user_settings() {
        let mut spec = ContainerSpec::new("web", "app:1.0");
        spec.env = vec!["PATH=/usr/bin".to_string(), "APP_MODE=prod".to_string()];
        spec.labels.insert("org.opencontainers.image.version".to_string(), "1.0".to_string());
        spec.labels.insert("stardeck.webui".to_string(), "true".to_string());
        spec.command = vec!["serve".to_string()];

        let image = ImageDetails {
            env: vec!["PATH=/usr/bin".to_string()],
            labels: [("org.opencontainers.image.version".to_string(), "1.0".to_string())]
                .into_iter()
                .collect(),
            cmd: vec!["serve".to_string()],
            ..Default::default()
        };

        spec.strip_image_defaults(&image);
        assert_eq!(spec.env, vec!["APP_MODE=prod".to_string()]);
        assert_eq!(spec.labels.len(), 1);
        assert!(spec.labels.contains_key("stardeck.webui"));
        assert!(spec.command.is_empty());
    }

    #[test]
    fn record_serializes_camel_case() {
        let record = ContainerRecord::new("abc123", "web", "app:1.0");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["engineId"], "abc123");
        assert_eq!(json["status"], "created");
        assert_eq!(json["webUi"]["enabled"], false);
    }
}
