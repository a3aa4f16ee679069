//! Stack driver: compose documents on disk, engine-native compose operations.
//!
//! The driver renders `compose.yaml` and `.env` into `stacks/<name>/`, runs compose actions
//! against that directory and reads the resulting container set back to compute status.
//! It never retries; failures go to the caller as-is.

use crate::engine::{
    ComposeAction, ComposeInvocation, ContainerEngine, ContainerFilter, LineStream,
};
use crate::error::{Result, StardeckError};
use crate::paths;
use crate::types::{ContainerStatus, ContainerSummary, StackStatus};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, instrument};

const MAX_STACK_NAME: usize = 63;

/// Aggregate view of a stack's containers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackState {
    pub status: StackStatus,
    pub total: usize,
    pub running: usize,
    pub containers: Vec<ContainerSummary>,
}

/// Drives compose stacks through the container engine.
#[derive(Clone)]
pub struct StackDriver {
    engine: Arc<dyn ContainerEngine>,
    stacks_root: PathBuf,
}

impl StackDriver {
    pub fn new(engine: Arc<dyn ContainerEngine>, stacks_root: PathBuf) -> Self {
        Self { engine, stacks_root }
    }

    pub fn stacks_root(&self) -> &Path {
        &self.stacks_root
    }

    /// Directory a stack renders into.
    pub fn stack_dir(&self, name: &str) -> PathBuf {
        self.stacks_root.join(name)
    }

    /// Stack names double as compose project names: lowercase letters, digits, `-` and `_`,
    /// starting with a letter or digit.
    pub fn validate_name(name: &str) -> Result<()> {
        let valid_start =
            name.chars().next().is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        let valid_chars = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if name.is_empty() || name.len() > MAX_STACK_NAME || !valid_start || !valid_chars {
            return Err(StardeckError::validation(format!(
                "invalid stack name '{}': use up to {} lowercase letters, digits, '-' or '_'",
                name, MAX_STACK_NAME
            )));
        }
        Ok(())
    }

    /// A compose document must parse as YAML and declare at least one service.
    pub fn validate_compose(content: &str) -> Result<()> {
        let doc: serde_yaml::Value = serde_yaml::from_str(content)
            .map_err(|e| StardeckError::validation(format!("invalid compose YAML: {}", e)))?;
        let services = doc
            .get("services")
            .and_then(|s| s.as_mapping())
            .ok_or_else(|| StardeckError::validation("compose document has no services mapping"))?;
        if services.is_empty() {
            return Err(StardeckError::validation("compose document declares no services"));
        }
        Ok(())
    }

    /// Write the compose file (and env file, when non-empty) for a stack.
    #[instrument(skip(self, compose_content, env_content))]
    pub async fn render(&self, name: &str, compose_content: &str, env_content: &str) -> Result<PathBuf> {
        Self::validate_name(name)?;
        let dir = self.stack_dir(name);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StardeckError::IoError { path: dir.clone(), source: e })?;

        write_atomic(&dir.join(paths::COMPOSE_FILE), compose_content).await?;

        let env_path = dir.join(paths::ENV_FILE);
        if env_content.trim().is_empty() {
            match fs::remove_file(&env_path).await {
                Ok(()) => debug!("Removed stale env file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StardeckError::IoError { path: env_path, source: e }),
            }
        } else {
            write_atomic(&env_path, env_content).await?;
        }

        info!(stack = %name, dir = %dir.display(), "Rendered stack files");
        Ok(dir)
    }

    /// Build the compose invocation for a stack directory.
    pub fn invocation(&self, name: &str, dir: &Path, action: ComposeAction) -> ComposeInvocation {
        let env_file = dir.join(paths::ENV_FILE);
        ComposeInvocation {
            project_dir: dir.to_path_buf(),
            project_name: name.to_string(),
            compose_file: dir.join(paths::COMPOSE_FILE),
            env_file: env_file.is_file().then_some(env_file),
            action,
        }
    }

    /// Run a compose action, streaming the tool's output.
    #[instrument(skip_all, fields(stack = %name, action = %action))]
    pub async fn run(&self, name: &str, dir: &Path, action: ComposeAction) -> Result<LineStream> {
        Self::validate_name(name)?;
        let compose_file = dir.join(paths::COMPOSE_FILE);
        if !compose_file.is_file() {
            return Err(StardeckError::not_found("compose file", compose_file.to_string_lossy()));
        }
        self.engine.compose(&self.invocation(name, dir, action)).await
    }

    /// Containers the engine reports as belonging to the stack.
    #[instrument(skip(self))]
    pub async fn containers(&self, name: &str) -> Result<Vec<ContainerSummary>> {
        self.engine.list_containers(&ContainerFilter::compose_project(name)).await
    }

    /// Compute aggregate status from the stack's containers.
    #[instrument(skip(self))]
    pub async fn status(&self, name: &str) -> Result<StackState> {
        let containers = self.containers(name).await?;
        let total = containers.len();
        let running = containers.iter().filter(|c| c.status == ContainerStatus::Running).count();
        Ok(StackState { status: StackStatus::from_counts(total, running), total, running, containers })
    }

    /// Delete a stack's rendered directory. Refuses paths outside the stacks root.
    #[instrument(skip(self))]
    pub async fn remove_files(&self, dir: &Path) -> Result<()> {
        if !dir.starts_with(&self.stacks_root) || dir == self.stacks_root {
            return Err(StardeckError::validation(format!(
                "refusing to remove {} outside the stacks directory",
                dir.display()
            )));
        }
        match fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StardeckError::IoError { path: dir.to_path_buf(), source: e }),
        }
    }
}

async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)
        .await
        .map_err(|e| StardeckError::IoError { path: tmp.clone(), source: e })?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| StardeckError::IoError { path: path.to_path_buf(), source: e })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_names() {
        for ok in ["blog", "my-stack", "app_2", "0day"] {
            assert!(StackDriver::validate_name(ok).is_ok(), "{}", ok);
        }
        let long = "x".repeat(64);
        for bad in ["", "Blog", "-lead", "a/b", "has space", long.as_str()] {
            assert!(StackDriver::validate_name(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn compose_validation() {
        assert!(StackDriver::validate_compose("services:\n  web:\n    image: nginx\n").is_ok());
        assert!(StackDriver::validate_compose("services: {}\n").is_err());
        assert!(StackDriver::validate_compose("version: '3'\n").is_err());
        assert!(StackDriver::validate_compose("services: [\n").is_err());
    }
}
