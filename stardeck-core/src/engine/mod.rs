//! Container engine adapter abstraction.
//!
//! Every other component drives the container engine through the `ContainerEngine`
//! trait. The adapter is stateless: it holds no knowledge of Stardeck records and
//! never retries on its own.
//!
//! - `DockerCli`: drives a Docker-compatible CLI (`docker`, `podman`)

use crate::error::Result;
use crate::types::{
    ContainerDetails, ContainerSpec, ContainerStats, ContainerSummary, ImageDetails,
    ImageSummary, NetworkSummary, ResourceCreate, VolumeSummary,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

mod docker;
mod stream;

pub use docker::DockerCli;
pub use stream::{ExecSession, LineStream};

/// Label the engine's compose implementation attaches to every stack container.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Container engine adapter.
///
/// Every method is bounded by the implementation's per-operation timeout and fails with
/// `NotFound`, `EngineUnavailable`, `Timeout`, `Conflict` or `Engine` (verbatim detail).
/// List and inspect calls have no side effects.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Adapter name (for logging/metrics).
    fn name(&self) -> &str;

    /// Check that the engine is reachable; returns its version string.
    async fn ping(&self) -> Result<String>;

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>>;

    /// Inspect a container by engine id or name.
    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails>;

    /// Whether a container with this id or name exists.
    async fn container_exists(&self, id: &str) -> Result<bool> {
        match self.inspect_container(id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create a container. Returns the new engine id.
    ///
    /// Not idempotent: callers must check `container_exists` when retrying after a
    /// partial failure.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a container, waiting up to `timeout` before the engine kills it.
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;

    async fn restart_container(&self, id: &str, timeout: Duration) -> Result<()>;

    async fn rename_container(&self, id: &str, new_name: &str) -> Result<()>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    async fn container_stats(&self, id: &str) -> Result<ContainerStats>;

    /// Stream container log lines.
    async fn stream_logs(&self, id: &str, options: &LogOptions) -> Result<LineStream>;

    /// Start an interactive command inside a running container.
    async fn exec(&self, id: &str, command: &[String]) -> Result<ExecSession>;

    async fn list_images(&self) -> Result<Vec<ImageSummary>>;

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails>;

    /// Whether an image is present locally.
    async fn image_exists(&self, reference: &str) -> Result<bool> {
        match self.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Pull an image, streaming progress lines.
    async fn pull_image(&self, reference: &str) -> Result<LineStream>;

    async fn remove_image(&self, reference: &str, force: bool) -> Result<()>;

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>>;

    /// Returns the volume name.
    async fn create_volume(&self, request: &ResourceCreate) -> Result<String>;

    async fn remove_volume(&self, name: &str, force: bool) -> Result<()>;

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>>;

    /// Returns the network id.
    async fn create_network(&self, request: &ResourceCreate) -> Result<String>;

    async fn remove_network(&self, name: &str) -> Result<()>;

    /// Run an engine-native compose operation, streaming its output.
    async fn compose(&self, invocation: &ComposeInvocation) -> Result<LineStream>;
}

/// Filters for listing containers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    /// Include stopped containers.
    pub all: bool,
    /// Name filter (substring match, as the engine does).
    pub name: Option<String>,
    /// `key=value` label filters, all must match.
    pub labels: Vec<(String, String)>,
}

impl ContainerFilter {
    pub fn all() -> Self {
        Self { all: true, ..Default::default() }
    }

    /// All containers belonging to a compose project.
    pub fn compose_project(project: &str) -> Self {
        Self {
            all: true,
            name: None,
            labels: vec![(COMPOSE_PROJECT_LABEL.to_string(), project.to_string())],
        }
    }
}

/// Options for log streaming.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    pub follow: bool,
    pub tail: Option<usize>,
    pub timestamps: bool,
    pub since: Option<String>,
}

/// Compose operations the stack driver can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComposeAction {
    #[serde(alias = "start")]
    Up,
    Down,
    Stop,
    Restart,
    Pull,
}

impl ComposeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Pull => "pull",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" | "start" => Some(Self::Up),
            "down" => Some(Self::Down),
            "stop" => Some(Self::Stop),
            "restart" => Some(Self::Restart),
            "pull" => Some(Self::Pull),
            _ => None,
        }
    }
}

impl std::fmt::Display for ComposeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compose command against one rendered stack directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeInvocation {
    pub project_dir: PathBuf,
    pub project_name: String,
    pub compose_file: PathBuf,
    pub env_file: Option<PathBuf>,
    pub action: ComposeAction,
}
