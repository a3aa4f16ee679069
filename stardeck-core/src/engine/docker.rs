//! Docker-compatible CLI adapter.
//!
//! Drives `docker` (or a compatible binary such as `podman`) through `tokio::process`.
//! Listings use `--format '{{json .}}'`; inspect calls parse the JSON array the CLI prints.

use super::stream::{spawn_error, spawn_interactive, spawn_lines, ProcessSpec};
use super::{
    ComposeAction, ComposeInvocation, ContainerEngine, ContainerFilter, ExecSession, LineStream,
    LogOptions,
};
use crate::config::EngineTimeouts;
use crate::error::{Result, StardeckError};
use crate::types::{
    ContainerDetails, ContainerSpec, ContainerStats, ContainerStatus, ContainerSummary,
    ImageDetails, ImageSummary, Mount, MountType, NetworkSummary, PortBinding, Protocol,
    ResourceCreate, ResourceLimits, RestartPolicy, VolumeSummary,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

const JSON_FORMAT: &str = "{{json .}}";

/// Container engine driven through its command-line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    timeouts: EngineTimeouts,
    stream_buffer: usize,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>, timeouts: EngineTimeouts) -> Self {
        Self { binary: binary.into(), timeouts, stream_buffer: 256 }
    }

    /// Run a short-lived command and return its stdout.
    async fn run(&self, operation: &str, args: &[String], timeout: Duration) -> Result<String> {
        debug!(operation, args = ?args, "running engine command");
        let output = tokio::time::timeout(
            timeout,
            Command::new(&self.binary)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            metrics::counter!("stardeck_engine_command_failures_total", "operation" => operation.to_string())
                .increment(1);
            StardeckError::Timeout { operation: operation.to_string(), seconds: timeout.as_secs() }
        })?
        .map_err(|e| spawn_error(&self.binary, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(operation, "engine command failed: {}", stderr);
            metrics::counter!("stardeck_engine_command_failures_total", "operation" => operation.to_string())
                .increment(1);
            return Err(classify_failure(operation, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn stream(&self, operation: &str, args: Vec<String>, timeout: Option<Duration>) -> Result<LineStream> {
        debug!(operation, args = ?args, "streaming engine command");
        spawn_lines(ProcessSpec {
            program: &self.binary,
            args,
            operation: operation.to_string(),
            timeout,
            buffer: self.stream_buffer,
        })
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    fn name(&self) -> &str {
        &self.binary
    }

    #[instrument(skip(self))]
    async fn ping(&self) -> Result<String> {
        let out = self
            .run(
                "engine version",
                &args(["version", "--format", "{{.Server.Version}}"]),
                self.timeouts.inspect(),
            )
            .await?;
        Ok(out.trim().to_string())
    }

    #[instrument(skip(self))]
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>> {
        let out = self
            .run("list containers", &list_container_args(filter), self.timeouts.inspect())
            .await?;
        parse_json_lines::<PsRow>(&out)?.into_iter().map(PsRow::into_summary).collect()
    }

    #[instrument(skip(self))]
    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let out = self
            .run(
                "inspect container",
                &args(["container", "inspect", "--", id]),
                self.timeouts.inspect(),
            )
            .await
            .map_err(|e| not_found_as("container", id, e))?;
        parse_container_inspect(&out)?
            .into_iter()
            .next()
            .ok_or_else(|| StardeckError::not_found("container", id))
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let out = self.run("create container", &create_args(spec), self.timeouts.create()).await?;
        let id = out.lines().last().unwrap_or_default().trim().to_string();
        if id.is_empty() {
            return Err(StardeckError::Engine {
                operation: "create container".to_string(),
                detail: "engine returned no container id".to_string(),
            });
        }
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn start_container(&self, id: &str) -> Result<()> {
        self.run("start container", &args(["start", id]), self.timeouts.mutate())
            .await
            .map_err(|e| not_found_as("container", id, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        let grace = timeout.as_secs().to_string();
        // The engine may take the whole grace period before killing, so allow for it.
        let limit = self.timeouts.mutate() + timeout;
        self.run("stop container", &args(["stop", "-t", &grace, id]), limit)
            .await
            .map_err(|e| not_found_as("container", id, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn restart_container(&self, id: &str, timeout: Duration) -> Result<()> {
        let grace = timeout.as_secs().to_string();
        let limit = self.timeouts.mutate() + timeout;
        self.run("restart container", &args(["restart", "-t", &grace, id]), limit)
            .await
            .map_err(|e| not_found_as("container", id, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn rename_container(&self, id: &str, new_name: &str) -> Result<()> {
        self.run("rename container", &args(["rename", id, new_name]), self.timeouts.mutate())
            .await
            .map_err(|e| not_found_as("container", id, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let mut argv = args(["rm"]);
        if force {
            argv.push("-f".to_string());
        }
        argv.push(id.to_string());
        self.run("remove container", &argv, self.timeouts.mutate())
            .await
            .map_err(|e| not_found_as("container", id, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn container_stats(&self, id: &str) -> Result<ContainerStats> {
        let out = self
            .run(
                "container stats",
                &args(["stats", "--no-stream", "--no-trunc", "--format", JSON_FORMAT, id]),
                self.timeouts.mutate(),
            )
            .await
            .map_err(|e| not_found_as("container", id, e))?;
        parse_json_lines::<StatsRow>(&out)?
            .into_iter()
            .next()
            .map(StatsRow::into_stats)
            .ok_or_else(|| StardeckError::not_found("container", id))
    }

    #[instrument(skip(self))]
    async fn stream_logs(&self, id: &str, options: &LogOptions) -> Result<LineStream> {
        // Resolve up front so a bad id fails fast instead of mid-stream.
        self.inspect_container(id).await?;
        let timeout = if options.follow { None } else { Some(self.timeouts.pull()) };
        self.stream("container logs", log_args(id, options), timeout)
    }

    #[instrument(skip(self))]
    async fn exec(&self, id: &str, command: &[String]) -> Result<ExecSession> {
        if command.is_empty() {
            return Err(StardeckError::validation("exec command must not be empty"));
        }
        let details = self.inspect_container(id).await?;
        if !details.running {
            return Err(StardeckError::conflict(format!("container {} is not running", details.name)));
        }
        let mut argv = args(["exec", "-i", id]);
        argv.extend(command.iter().cloned());
        spawn_interactive(ProcessSpec {
            program: &self.binary,
            args: argv,
            operation: "exec".to_string(),
            timeout: None,
            buffer: self.stream_buffer,
        })
    }

    #[instrument(skip(self))]
    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        let out = self
            .run(
                "list images",
                &args(["images", "--no-trunc", "--format", JSON_FORMAT]),
                self.timeouts.inspect(),
            )
            .await?;
        Ok(parse_json_lines::<ImageRow>(&out)?.into_iter().map(ImageRow::into_summary).collect())
    }

    #[instrument(skip(self))]
    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails> {
        let out = self
            .run(
                "inspect image",
                &args(["image", "inspect", "--", reference]),
                self.timeouts.inspect(),
            )
            .await
            .map_err(|e| not_found_as("image", reference, e))?;
        parse_image_inspect(&out)?
            .into_iter()
            .next()
            .ok_or_else(|| StardeckError::not_found("image", reference))
    }

    #[instrument(skip(self))]
    async fn pull_image(&self, reference: &str) -> Result<LineStream> {
        self.stream("pull image", args(["pull", reference]), Some(self.timeouts.pull()))
    }

    #[instrument(skip(self))]
    async fn remove_image(&self, reference: &str, force: bool) -> Result<()> {
        let mut argv = args(["rmi"]);
        if force {
            argv.push("-f".to_string());
        }
        argv.push(reference.to_string());
        self.run("remove image", &argv, self.timeouts.mutate())
            .await
            .map_err(|e| not_found_as("image", reference, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>> {
        let out = self
            .run("list volumes", &args(["volume", "ls", "--format", JSON_FORMAT]), self.timeouts.inspect())
            .await?;
        Ok(parse_json_lines::<VolumeRow>(&out)?.into_iter().map(VolumeRow::into_summary).collect())
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    async fn create_volume(&self, request: &ResourceCreate) -> Result<String> {
        let out = self
            .run("create volume", &resource_create_args("volume", request), self.timeouts.mutate())
            .await?;
        Ok(out.trim().to_string())
    }

    #[instrument(skip(self))]
    async fn remove_volume(&self, name: &str, force: bool) -> Result<()> {
        let mut argv = args(["volume", "rm"]);
        if force {
            argv.push("-f".to_string());
        }
        argv.push(name.to_string());
        self.run("remove volume", &argv, self.timeouts.mutate())
            .await
            .map_err(|e| not_found_as("volume", name, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_networks(&self) -> Result<Vec<NetworkSummary>> {
        let out = self
            .run(
                "list networks",
                &args(["network", "ls", "--no-trunc", "--format", JSON_FORMAT]),
                self.timeouts.inspect(),
            )
            .await?;
        Ok(parse_json_lines::<NetworkRow>(&out)?.into_iter().map(NetworkRow::into_summary).collect())
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    async fn create_network(&self, request: &ResourceCreate) -> Result<String> {
        let out = self
            .run("create network", &resource_create_args("network", request), self.timeouts.mutate())
            .await?;
        Ok(out.trim().to_string())
    }

    #[instrument(skip(self))]
    async fn remove_network(&self, name: &str) -> Result<()> {
        self.run("remove network", &args(["network", "rm", name]), self.timeouts.mutate())
            .await
            .map_err(|e| not_found_as("network", name, e))?;
        Ok(())
    }

    #[instrument(skip(self, invocation), fields(project = %invocation.project_name, action = %invocation.action))]
    async fn compose(&self, invocation: &ComposeInvocation) -> Result<LineStream> {
        let operation = format!("compose {}", invocation.action);
        self.stream(&operation, compose_args(invocation), Some(self.timeouts.pull()))
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Map engine stderr onto the error taxonomy. Unrecognised failures keep the text verbatim.
pub(crate) fn classify_failure(operation: &str, stderr: &str) -> StardeckError {
    let lower = stderr.to_lowercase();
    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
        || lower.contains("cannot connect to podman")
    {
        StardeckError::EngineUnavailable { reason: stderr.to_string() }
    } else if lower.contains("no such container")
        || lower.contains("no such image")
        || lower.contains("no such object")
        || lower.contains("no such volume")
        || lower.contains("no such network")
        || (lower.contains("network") && lower.contains("not found"))
    {
        StardeckError::NotFound { kind: "resource", id: stderr.to_string() }
    } else if lower.contains("conflict")
        || lower.contains("already in use")
        || lower.contains("already exists")
        || lower.contains("port is already allocated")
    {
        StardeckError::Conflict { reason: stderr.to_string() }
    } else {
        StardeckError::Engine { operation: operation.to_string(), detail: stderr.to_string() }
    }
}

/// Re-key a generic not-found from the engine onto the thing that was asked for.
fn not_found_as(kind: &'static str, id: &str, err: StardeckError) -> StardeckError {
    match err {
        StardeckError::NotFound { .. } => StardeckError::not_found(kind, id),
        other => other,
    }
}

fn list_container_args(filter: &ContainerFilter) -> Vec<String> {
    let mut argv = args(["ps", "--no-trunc", "--format", JSON_FORMAT]);
    if filter.all {
        argv.push("-a".to_string());
    }
    if let Some(name) = &filter.name {
        argv.push("--filter".to_string());
        argv.push(format!("name={}", name));
    }
    for (key, value) in &filter.labels {
        argv.push("--filter".to_string());
        argv.push(format!("label={}={}", key, value));
    }
    argv
}

fn log_args(id: &str, options: &LogOptions) -> Vec<String> {
    let mut argv = args(["logs"]);
    if options.follow {
        argv.push("--follow".to_string());
    }
    if let Some(tail) = options.tail {
        argv.push("--tail".to_string());
        argv.push(tail.to_string());
    }
    if options.timestamps {
        argv.push("--timestamps".to_string());
    }
    if let Some(since) = &options.since {
        argv.push("--since".to_string());
        argv.push(since.clone());
    }
    argv.push(id.to_string());
    argv
}

fn resource_create_args(kind: &str, request: &ResourceCreate) -> Vec<String> {
    let mut argv = vec![kind.to_string(), "create".to_string()];
    if let Some(driver) = &request.driver {
        argv.push("--driver".to_string());
        argv.push(driver.clone());
    }
    let mut labels: Vec<_> = request.labels.iter().collect();
    labels.sort();
    for (key, value) in labels {
        argv.push("--label".to_string());
        argv.push(format!("{}={}", key, value));
    }
    argv.push(request.name.clone());
    argv
}

pub(crate) fn compose_args(invocation: &ComposeInvocation) -> Vec<String> {
    let mut argv = vec![
        "compose".to_string(),
        "--project-directory".to_string(),
        invocation.project_dir.to_string_lossy().to_string(),
        "-p".to_string(),
        invocation.project_name.clone(),
        "-f".to_string(),
        invocation.compose_file.to_string_lossy().to_string(),
    ];
    if let Some(env_file) = &invocation.env_file {
        argv.push("--env-file".to_string());
        argv.push(env_file.to_string_lossy().to_string());
    }
    match invocation.action {
        ComposeAction::Up => argv.extend(args(["up", "-d", "--remove-orphans"])),
        ComposeAction::Down => argv.extend(args(["down", "--remove-orphans"])),
        ComposeAction::Stop => argv.push("stop".to_string()),
        ComposeAction::Restart => argv.push("restart".to_string()),
        ComposeAction::Pull => argv.push("pull".to_string()),
    }
    argv
}

/// Build `create` arguments that reproduce `spec`.
pub(crate) fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut argv = args(["create", "--name"]);
    argv.push(spec.name.clone());

    if let Some(hostname) = &spec.hostname {
        argv.push("--hostname".to_string());
        argv.push(hostname.clone());
    }
    if let Some(dir) = &spec.working_dir {
        argv.push("--workdir".to_string());
        argv.push(dir.clone());
    }
    if let Some(user) = &spec.user {
        argv.push("--user".to_string());
        argv.push(user.clone());
    }
    for entry in &spec.env {
        argv.push("--env".to_string());
        argv.push(entry.clone());
    }
    for (key, value) in &spec.labels {
        argv.push("--label".to_string());
        argv.push(format!("{}={}", key, value));
    }
    for port in &spec.ports {
        argv.push("--publish".to_string());
        argv.push(publish_arg(port));
    }
    for mount in &spec.mounts {
        argv.push("--mount".to_string());
        argv.push(mount_arg(mount));
    }
    if spec.restart_policy != RestartPolicy::No {
        argv.push("--restart".to_string());
        argv.push(spec.restart_policy.to_arg());
    }
    if let Some(mode) = &spec.network_mode {
        argv.push("--network".to_string());
        argv.push(mode.clone());
    }
    if let Some(memory) = spec.resources.memory_bytes {
        argv.push("--memory".to_string());
        argv.push(memory.to_string());
    }
    if let Some(nano) = spec.resources.nano_cpus {
        argv.push("--cpus".to_string());
        argv.push(format!("{}", nano as f64 / 1e9));
    }
    if let Some(shares) = spec.resources.cpu_shares {
        argv.push("--cpu-shares".to_string());
        argv.push(shares.to_string());
    }
    if spec.privileged {
        argv.push("--privileged".to_string());
    }
    for cap in &spec.cap_add {
        argv.push("--cap-add".to_string());
        argv.push(cap.clone());
    }
    for host in &spec.extra_hosts {
        argv.push("--add-host".to_string());
        argv.push(host.clone());
    }

    // `--entrypoint` takes a single word; the rest of the entrypoint prefixes the command.
    let mut command = spec.command.clone();
    if let Some(entrypoint) = &spec.entrypoint {
        argv.push("--entrypoint".to_string());
        match entrypoint.split_first() {
            Some((first, rest)) => {
                argv.push(first.clone());
                command = rest.iter().cloned().chain(command).collect();
            }
            None => argv.push(String::new()),
        }
    }

    argv.push(spec.image.clone());
    argv.extend(command);
    argv
}

fn publish_arg(port: &PortBinding) -> String {
    let container = format!("{}/{}", port.container_port, port.protocol.as_str());
    match (&port.host_ip, port.host_port) {
        (Some(ip), Some(host)) => format!("{}:{}:{}", ip, host, container),
        (Some(ip), None) => format!("{}::{}", ip, container),
        (None, Some(host)) => format!("{}:{}", host, container),
        (None, None) => container,
    }
}

fn mount_arg(mount: &Mount) -> String {
    let mut arg = match mount.kind {
        MountType::Bind => format!("type=bind,source={},target={}", mount.source, mount.destination),
        MountType::Volume => {
            format!("type=volume,source={},target={}", mount.source, mount.destination)
        }
        MountType::Tmpfs => format!("type=tmpfs,target={}", mount.destination),
    };
    if mount.read_only {
        arg.push_str(",readonly");
    }
    arg
}

fn parse_json_lines<T: for<'de> Deserialize<'de>>(out: &str) -> Result<Vec<T>> {
    out.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| StardeckError::Engine {
                operation: "parse engine output".to_string(),
                detail: format!("{}: {}", e, line),
            })
        })
        .collect()
}

/// Parse the `a=b,c=d` label list the CLI prints in listings.
fn parse_label_list(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

#[derive(Deserialize)]
struct PsRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

impl PsRow {
    fn into_summary(self) -> Result<ContainerSummary> {
        // Older engines omit State; derive it from the status text.
        let status = if self.state.is_empty() {
            if self.status.starts_with("Up") {
                ContainerStatus::Running
            } else if self.status.starts_with("Exited") {
                ContainerStatus::Exited
            } else {
                ContainerStatus::from_engine(&self.status)
            }
        } else {
            ContainerStatus::from_engine(&self.state)
        };
        let name = self.names.split(',').next().unwrap_or_default().trim_start_matches('/');
        Ok(ContainerSummary {
            engine_id: self.id,
            name: name.to_string(),
            image: self.image,
            status,
            status_text: self.status,
            labels: parse_label_list(&self.labels),
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectContainer {
    id: String,
    name: String,
    created: Option<String>,
    image: String,
    state: InspectState,
    config: InspectConfig,
    host_config: InspectHostConfig,
    #[serde(default)]
    mounts: Vec<InspectMount>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    running: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InspectConfig {
    image: String,
    hostname: Option<String>,
    user: Option<String>,
    working_dir: Option<String>,
    env: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
    entrypoint: Option<Vec<String>>,
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InspectHostConfig {
    port_bindings: Option<HashMap<String, Option<Vec<InspectHostPort>>>>,
    restart_policy: Option<InspectRestartPolicy>,
    network_mode: Option<String>,
    memory: Option<i64>,
    nano_cpus: Option<i64>,
    cpu_shares: Option<i64>,
    privileged: bool,
    cap_add: Option<Vec<String>>,
    extra_hosts: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostPort {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRestartPolicy {
    #[serde(default)]
    name: String,
    #[serde(default)]
    maximum_retry_count: u32,
}

#[derive(Deserialize)]
struct InspectMount {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Name", default)]
    name: Option<String>,
    #[serde(rename = "Source", default)]
    source: String,
    #[serde(rename = "Destination")]
    destination: String,
    #[serde(rename = "RW", default = "default_true")]
    rw: bool,
}

fn default_true() -> bool {
    true
}

fn parse_container_inspect(out: &str) -> Result<Vec<ContainerDetails>> {
    let raw: Vec<InspectContainer> = serde_json::from_str(out).map_err(|e| StardeckError::Engine {
        operation: "parse container inspect".to_string(),
        detail: e.to_string(),
    })?;
    Ok(raw.into_iter().map(InspectContainer::into_details).collect())
}

impl InspectContainer {
    fn into_details(self) -> ContainerDetails {
        let name = self.name.trim_start_matches('/').to_string();
        let host = self.host_config;
        let config = self.config;

        let mut ports: Vec<PortBinding> = host
            .port_bindings
            .unwrap_or_default()
            .into_iter()
            .flat_map(|(key, bindings)| {
                let (port, proto) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
                let container_port = port.parse::<u16>().ok();
                let protocol = if proto == "udp" { Protocol::Udp } else { Protocol::Tcp };
                bindings
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(move |b| {
                        Some(PortBinding {
                            host_ip: (!b.host_ip.is_empty()).then_some(b.host_ip),
                            host_port: b.host_port.parse().ok(),
                            container_port: container_port?,
                            protocol,
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        ports.sort_by_key(|p| (p.container_port, p.protocol.as_str(), p.host_port));

        let mounts = self
            .mounts
            .into_iter()
            .filter_map(|m| {
                let kind = MountType::from_engine(&m.kind)?;
                let source = match kind {
                    MountType::Volume => m.name.unwrap_or(m.source),
                    _ => m.source,
                };
                Some(Mount { kind, source, destination: m.destination, read_only: !m.rw })
            })
            .collect();

        let restart_policy = host
            .restart_policy
            .map(|r| RestartPolicy::from_engine(&r.name, r.maximum_retry_count))
            .unwrap_or_default();

        // The engine defaults the hostname to the short id; keeping that would pin the old id.
        let hostname = config
            .hostname
            .filter(|h| !h.is_empty() && !self.id.starts_with(h.as_str()));

        let spec = ContainerSpec {
            name: name.clone(),
            image: config.image,
            command: config.cmd.unwrap_or_default(),
            entrypoint: config.entrypoint,
            env: config.env.unwrap_or_default(),
            ports,
            mounts,
            restart_policy,
            network_mode: host.network_mode.filter(|m| !m.is_empty() && m != "default"),
            resources: ResourceLimits {
                memory_bytes: host.memory.filter(|v| *v > 0),
                nano_cpus: host.nano_cpus.filter(|v| *v > 0),
                cpu_shares: host.cpu_shares.filter(|v| *v > 0),
            },
            labels: config.labels.unwrap_or_default(),
            hostname,
            working_dir: config.working_dir.filter(|d| !d.is_empty()),
            user: config.user.filter(|u| !u.is_empty()),
            privileged: host.privileged,
            cap_add: host.cap_add.unwrap_or_default(),
            extra_hosts: host.extra_hosts.unwrap_or_default(),
        };

        ContainerDetails {
            engine_id: self.id,
            name,
            status: ContainerStatus::from_engine(&self.state.status),
            running: self.state.running,
            image_id: self.image,
            created: self.created,
            spec,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectImage {
    id: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    config: Option<InspectConfig>,
}

fn parse_image_inspect(out: &str) -> Result<Vec<ImageDetails>> {
    let raw: Vec<InspectImage> = serde_json::from_str(out).map_err(|e| StardeckError::Engine {
        operation: "parse image inspect".to_string(),
        detail: e.to_string(),
    })?;
    Ok(raw
        .into_iter()
        .map(|image| {
            let config = image.config.unwrap_or_default();
            ImageDetails {
                id: image.id,
                tags: image.repo_tags.unwrap_or_default(),
                size_bytes: image.size,
                created: image.created,
                env: config.env.unwrap_or_default(),
                labels: config.labels.unwrap_or_default(),
                cmd: config.cmd.unwrap_or_default(),
                entrypoint: config.entrypoint,
            }
        })
        .collect())
}

#[derive(Deserialize)]
struct StatsRow {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "CPUPerc", default)]
    cpu: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
    #[serde(rename = "MemPerc", default)]
    mem_perc: String,
    #[serde(rename = "NetIO", default)]
    net_io: String,
    #[serde(rename = "BlockIO", default)]
    block_io: String,
    #[serde(rename = "PIDs", default)]
    pids: String,
}

impl StatsRow {
    fn into_stats(self) -> ContainerStats {
        let (mem_used, mem_limit) = split_pair(&self.mem_usage);
        let (net_rx, net_tx) = split_pair(&self.net_io);
        let (block_read, block_write) = split_pair(&self.block_io);
        ContainerStats {
            engine_id: self.id,
            name: self.name,
            cpu_percent: parse_percent(&self.cpu),
            memory_usage_bytes: mem_used,
            memory_limit_bytes: mem_limit,
            memory_percent: parse_percent(&self.mem_perc),
            network_rx_bytes: net_rx,
            network_tx_bytes: net_tx,
            block_read_bytes: block_read,
            block_write_bytes: block_write,
            pids: self.pids.trim().parse().unwrap_or(0),
        }
    }
}

fn split_pair(raw: &str) -> (u64, u64) {
    let (a, b) = raw.split_once('/').unwrap_or((raw, ""));
    (parse_size(a).unwrap_or(0), parse_size(b).unwrap_or(0))
}

fn parse_percent(raw: &str) -> f64 {
    raw.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}

/// Parse an engine-formatted size like `1.5GiB`, `512kB` or `0B` into bytes.
pub(crate) fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let split = raw.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}

#[derive(Deserialize)]
struct ImageRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Repository", default)]
    repository: String,
    #[serde(rename = "Tag", default)]
    tag: String,
    #[serde(rename = "Size", default)]
    size: String,
    #[serde(rename = "CreatedAt", default)]
    created_at: String,
}

impl ImageRow {
    fn into_summary(self) -> ImageSummary {
        ImageSummary {
            id: self.id,
            repository: self.repository,
            tag: self.tag,
            size: self.size,
            created: self.created_at,
        }
    }
}

#[derive(Deserialize)]
struct VolumeRow {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Driver", default)]
    driver: String,
    #[serde(rename = "Mountpoint", default)]
    mountpoint: Option<String>,
    #[serde(rename = "Labels", default)]
    labels: String,
}

impl VolumeRow {
    fn into_summary(self) -> VolumeSummary {
        VolumeSummary {
            name: self.name,
            driver: self.driver,
            mountpoint: self.mountpoint.filter(|m| !m.is_empty()),
            labels: parse_label_list(&self.labels),
        }
    }
}

#[derive(Deserialize)]
struct NetworkRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Driver", default)]
    driver: String,
    #[serde(rename = "Scope", default)]
    scope: String,
}

impl NetworkRow {
    fn into_summary(self) -> NetworkSummary {
        NetworkSummary { id: self.id, name: self.name, driver: self.driver, scope: self.scope }
    }
}
