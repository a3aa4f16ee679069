//! Shared fixtures: an in-memory container engine with per-operation failure injection.

#![allow(dead_code)]

use async_trait::async_trait;
use stardeck_core::engine::{
    ComposeAction, ComposeInvocation, ContainerEngine, ContainerFilter, ExecSession, LineStream,
    LogOptions, COMPOSE_PROJECT_LABEL,
};
use stardeck_core::error::{Result, StardeckError};
use stardeck_core::progress::{self, ProgressEvent, ProgressReporter, ProgressStream};
use stardeck_core::types::{
    ContainerDetails, ContainerRecord, ContainerSpec, ContainerStats, ContainerStatus,
    ContainerSummary, ImageDetails, ImageSummary, NetworkSummary, ResourceCreate, VolumeSummary,
};
use stardeck_core::{
    BackupManager, LogAuditSink, MetadataStore, StackDriver, StateManager, WorkflowSettings,
    Workflows,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Inspect,
    Create,
    /// Create fails but leaves a container behind under the requested name
    CreatePartial,
    Start,
    Stop,
    Rename,
    Remove,
    Pull,
    Compose,
}

#[derive(Default)]
struct MockState {
    containers: BTreeMap<String, ContainerDetails>,
    images: HashMap<String, ImageDetails>,
    volumes: HashSet<String>,
    networks: HashSet<String>,
    failures: HashMap<Op, String>,
    /// Fail `Start` only for containers created after this point
    fail_start_of_new: bool,
    next_id: u64,
    calls: Vec<String>,
}

/// In-memory engine. Ids are 64 hex characters like a real engine's.
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&self, reference: &str) {
        let mut state = self.state.lock().unwrap();
        let id = format!("sha256:{:0>64}", state.images.len() + 1);
        state.images.insert(
            reference.to_string(),
            ImageDetails { id, tags: vec![reference.to_string()], ..Default::default() },
        );
    }

    pub fn add_image_details(&self, reference: &str, details: ImageDetails) {
        self.state.lock().unwrap().images.insert(reference.to_string(), details);
    }

    /// Create and start a container directly, bypassing failure injection.
    pub fn add_running(&self, spec: ContainerSpec) -> String {
        let mut state = self.state.lock().unwrap();
        let id = Self::allocate(&mut state);
        let image_id =
            state.images.get(&spec.image).map(|i| i.id.clone()).unwrap_or_default();
        state.containers.insert(
            id.clone(),
            ContainerDetails {
                engine_id: id.clone(),
                name: spec.name.clone(),
                status: ContainerStatus::Running,
                running: true,
                image_id,
                created: None,
                spec,
            },
        );
        id
    }

    pub fn fail(&self, op: Op, message: &str) {
        self.state.lock().unwrap().failures.insert(op, message.to_string());
    }

    /// Make `start` fail only for containers the workflow creates.
    pub fn fail_start_of_new_containers(&self) {
        self.state.lock().unwrap().fail_start_of_new = true;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.failures.clear();
        state.fail_start_of_new = false;
    }

    pub fn containers(&self) -> Vec<ContainerDetails> {
        self.state.lock().unwrap().containers.values().cloned().collect()
    }

    /// Containers currently holding `name`.
    pub fn named(&self, name: &str) -> Vec<ContainerDetails> {
        self.containers().into_iter().filter(|c| c.name == name).collect()
    }

    pub fn get(&self, id: &str) -> Option<ContainerDetails> {
        self.state.lock().unwrap().containers.get(id).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn allocate(state: &mut MockState) -> String {
        state.next_id += 1;
        format!("{:064x}", state.next_id)
    }

    fn check(state: &mut MockState, op: Op, call: String) -> Result<()> {
        state.calls.push(call);
        match state.failures.get(&op) {
            Some(detail) => Err(StardeckError::Engine {
                operation: format!("{:?}", op).to_lowercase(),
                detail: detail.clone(),
            }),
            None => Ok(()),
        }
    }

    fn find<'a>(state: &'a MockState, key: &str) -> Option<&'a ContainerDetails> {
        state.containers.get(key).or_else(|| {
            state
                .containers
                .values()
                .find(|c| c.name == key || (key.len() >= 12 && c.engine_id.starts_with(key)))
        })
    }

    fn find_id(state: &MockState, key: &str) -> Result<String> {
        Self::find(state, key)
            .map(|c| c.engine_id.clone())
            .ok_or_else(|| StardeckError::not_found("container", key))
    }

    fn summary(details: &ContainerDetails) -> ContainerSummary {
        ContainerSummary {
            engine_id: details.engine_id.clone(),
            name: details.name.clone(),
            image: details.spec.image.clone(),
            status: details.status,
            status_text: details.status.as_str().to_string(),
            labels: details.spec.labels.clone().into_iter().collect(),
        }
    }

    fn compose_services(invocation: &ComposeInvocation) -> Result<Vec<(String, String)>> {
        let content = std::fs::read_to_string(&invocation.compose_file).map_err(|e| {
            StardeckError::IoError { path: invocation.compose_file.clone(), source: e }
        })?;
        let doc: serde_yaml::Value = serde_yaml::from_str(&content)
            .map_err(|e| StardeckError::validation(e.to_string()))?;
        let mut services = Vec::new();
        if let Some(map) = doc.get("services").and_then(|s| s.as_mapping()) {
            for (name, service) in map {
                let name = name.as_str().unwrap_or_default().to_string();
                let image = service
                    .get("image")
                    .and_then(|i| i.as_str())
                    .unwrap_or("scratch")
                    .to_string();
                services.push((name, image));
            }
        }
        Ok(services)
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn ping(&self) -> Result<String> {
        Ok("mock-1.0".to_string())
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .values()
            .filter(|c| filter.all || c.running)
            .filter(|c| filter.name.as_ref().map_or(true, |n| c.name.contains(n.as_str())))
            .filter(|c| filter.labels.iter().all(|(k, v)| c.spec.labels.get(k) == Some(v)))
            .map(Self::summary)
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let mut state = self.state.lock().unwrap();
        Self::check(&mut state, Op::Inspect, format!("inspect {}", id))?;
        Self::find(&state, id).cloned().ok_or_else(|| StardeckError::not_found("container", id))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let call = format!("create {} {}", spec.name, spec.image);

        if let Some(detail) = state.failures.get(&Op::CreatePartial).cloned() {
            state.calls.push(call);
            let id = Self::allocate(&mut state);
            let details = ContainerDetails {
                engine_id: id.clone(),
                name: spec.name.clone(),
                status: ContainerStatus::Created,
                running: false,
                image_id: String::new(),
                created: None,
                spec: spec.clone(),
            };
            state.containers.insert(id, details);
            return Err(StardeckError::Engine { operation: "create".to_string(), detail });
        }

        Self::check(&mut state, Op::Create, call)?;
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(StardeckError::conflict(format!(
                "the container name \"/{}\" is already in use",
                spec.name
            )));
        }
        if !state.images.contains_key(&spec.image) {
            return Err(StardeckError::not_found("image", &spec.image));
        }
        let id = Self::allocate(&mut state);
        let image_id = state.images.get(&spec.image).map(|i| i.id.clone()).unwrap_or_default();
        state.containers.insert(
            id.clone(),
            ContainerDetails {
                engine_id: id.clone(),
                name: spec.name.clone(),
                status: ContainerStatus::Created,
                running: false,
                image_id,
                created: None,
                spec: spec.clone(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let engine_id = Self::find_id(&state, id)?;
        let is_new = state
            .containers
            .get(&engine_id)
            .is_some_and(|c| c.status == ContainerStatus::Created);
        if state.fail_start_of_new && is_new {
            state.calls.push(format!("start {}", engine_id));
            return Err(StardeckError::Engine {
                operation: "start".to_string(),
                detail: "OCI runtime create failed: exec: \"/app\": not found".to_string(),
            });
        }
        Self::check(&mut state, Op::Start, format!("start {}", engine_id))?;
        if let Some(c) = state.containers.get_mut(&engine_id) {
            c.status = ContainerStatus::Running;
            c.running = true;
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let engine_id = Self::find_id(&state, id)?;
        Self::check(&mut state, Op::Stop, format!("stop {}", engine_id))?;
        if let Some(c) = state.containers.get_mut(&engine_id) {
            c.status = ContainerStatus::Exited;
            c.running = false;
        }
        Ok(())
    }

    async fn restart_container(&self, id: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let engine_id = Self::find_id(&state, id)?;
        Self::check(&mut state, Op::Start, format!("restart {}", engine_id))?;
        if let Some(c) = state.containers.get_mut(&engine_id) {
            c.status = ContainerStatus::Running;
            c.running = true;
        }
        Ok(())
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let engine_id = Self::find_id(&state, id)?;
        Self::check(&mut state, Op::Rename, format!("rename {} {}", engine_id, new_name))?;
        if state.containers.values().any(|c| c.name == new_name && c.engine_id != engine_id) {
            return Err(StardeckError::conflict(format!(
                "the container name \"/{}\" is already in use",
                new_name
            )));
        }
        if let Some(c) = state.containers.get_mut(&engine_id) {
            c.name = new_name.to_string();
            c.spec.name = new_name.to_string();
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let engine_id = Self::find_id(&state, id)?;
        Self::check(&mut state, Op::Remove, format!("remove {}", engine_id))?;
        if !force && state.containers.get(&engine_id).is_some_and(|c| c.running) {
            return Err(StardeckError::conflict("cannot remove a running container"));
        }
        state.containers.remove(&engine_id);
        Ok(())
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStats> {
        let state = self.state.lock().unwrap();
        let details =
            Self::find(&state, id).ok_or_else(|| StardeckError::not_found("container", id))?;
        Ok(ContainerStats {
            engine_id: details.engine_id.clone(),
            name: details.name.clone(),
            ..Default::default()
        })
    }

    async fn stream_logs(&self, id: &str, _options: &LogOptions) -> Result<LineStream> {
        let state = self.state.lock().unwrap();
        let details =
            Self::find(&state, id).ok_or_else(|| StardeckError::not_found("container", id))?;
        Ok(LineStream::from_lines(
            vec![format!("{} started", details.name), "listening on :8080".to_string()],
            Ok(()),
        ))
    }

    async fn exec(&self, id: &str, command: &[String]) -> Result<ExecSession> {
        {
            let state = self.state.lock().unwrap();
            let details =
                Self::find(&state, id).ok_or_else(|| StardeckError::not_found("container", id))?;
            if !details.running {
                return Err(StardeckError::conflict(format!("{} is not running", details.name)));
            }
        }
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(8);
        let (line_tx, line_rx) = mpsc::channel(8);
        let greeting = format!("$ {}", command.join(" "));
        let producer = tokio::spawn(async move {
            let _ = line_tx.send(greeting).await;
            while let Some(data) = input_rx.recv().await {
                let text = String::from_utf8_lossy(&data).trim_end().to_string();
                if line_tx.send(text).await.is_err() {
                    break;
                }
            }
            Ok(())
        });
        Ok(ExecSession::new(LineStream::new(line_rx, producer), input_tx))
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .images
            .iter()
            .map(|(reference, image)| ImageSummary {
                id: image.id.clone(),
                repository: reference.split(':').next().unwrap_or_default().to_string(),
                tag: reference.split(':').nth(1).unwrap_or("latest").to_string(),
                size: format!("{}B", image.size_bytes),
                created: String::new(),
            })
            .collect())
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails> {
        let state = self.state.lock().unwrap();
        state
            .images
            .get(reference)
            .or_else(|| state.images.values().find(|i| i.id == reference))
            .cloned()
            .ok_or_else(|| StardeckError::not_found("image", reference))
    }

    async fn pull_image(&self, reference: &str) -> Result<LineStream> {
        {
            let mut state = self.state.lock().unwrap();
            Self::check(&mut state, Op::Pull, format!("pull {}", reference))?;
        }
        if !self.state.lock().unwrap().images.contains_key(reference) {
            self.add_image(reference);
        }
        Ok(LineStream::from_lines(
            vec![
                format!("{}: Pulling from library", reference),
                "Digest: sha256:feedface".to_string(),
                format!("Status: Downloaded newer image for {}", reference),
            ],
            Ok(()),
        ))
    }

    async fn remove_image(&self, reference: &str, _force: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .images
            .remove(reference)
            .map(|_| ())
            .ok_or_else(|| StardeckError::not_found("image", reference))
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .volumes
            .iter()
            .map(|name| VolumeSummary {
                name: name.clone(),
                driver: "local".to_string(),
                mountpoint: None,
                labels: HashMap::new(),
            })
            .collect())
    }

    async fn create_volume(&self, request: &ResourceCreate) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if !state.volumes.insert(request.name.clone()) {
            return Err(StardeckError::conflict(format!("volume {} already exists", request.name)));
        }
        Ok(request.name.clone())
    }

    async fn remove_volume(&self, name: &str, _force: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.volumes.remove(name) {
            return Err(StardeckError::not_found("volume", name));
        }
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .networks
            .iter()
            .map(|name| NetworkSummary {
                id: name.clone(),
                name: name.clone(),
                driver: "bridge".to_string(),
                scope: "local".to_string(),
            })
            .collect())
    }

    async fn create_network(&self, request: &ResourceCreate) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if !state.networks.insert(request.name.clone()) {
            return Err(StardeckError::conflict(format!(
                "network with name {} already exists",
                request.name
            )));
        }
        Ok(request.name.clone())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.networks.remove(name) {
            return Err(StardeckError::not_found("network", name));
        }
        Ok(())
    }

    async fn compose(&self, invocation: &ComposeInvocation) -> Result<LineStream> {
        let project = invocation.project_name.clone();
        {
            let mut state = self.state.lock().unwrap();
            Self::check(
                &mut state,
                Op::Compose,
                format!("compose {} {}", project, invocation.action),
            )?;
        }
        let services = Self::compose_services(invocation)?;

        let mut state = self.state.lock().unwrap();
        let members: Vec<String> = state
            .containers
            .values()
            .filter(|c| c.spec.labels.get(COMPOSE_PROJECT_LABEL) == Some(&project))
            .map(|c| c.engine_id.clone())
            .collect();
        let mut lines = Vec::new();

        match invocation.action {
            ComposeAction::Up => {
                for (service, image) in services {
                    let name = format!("{}-{}-1", project, service);
                    let existing = state.containers.values_mut().find(|c| c.name == name);
                    match existing {
                        Some(c) => {
                            c.status = ContainerStatus::Running;
                            c.running = true;
                        }
                        None => {
                            let id = Self::allocate(&mut state);
                            let mut spec = ContainerSpec::new(&name, &image);
                            spec.labels.insert(COMPOSE_PROJECT_LABEL.to_string(), project.clone());
                            state.containers.insert(
                                id.clone(),
                                ContainerDetails {
                                    engine_id: id,
                                    name: name.clone(),
                                    status: ContainerStatus::Running,
                                    running: true,
                                    image_id: String::new(),
                                    created: None,
                                    spec,
                                },
                            );
                        }
                    }
                    lines.push(format!("Container {} Started", name));
                }
            }
            ComposeAction::Down => {
                for id in members {
                    if let Some(c) = state.containers.remove(&id) {
                        lines.push(format!("Container {} Removed", c.name));
                    }
                }
            }
            ComposeAction::Stop => {
                for id in members {
                    if let Some(c) = state.containers.get_mut(&id) {
                        c.status = ContainerStatus::Exited;
                        c.running = false;
                        lines.push(format!("Container {} Stopped", c.name));
                    }
                }
            }
            ComposeAction::Restart => {
                for id in members {
                    if let Some(c) = state.containers.get_mut(&id) {
                        c.status = ContainerStatus::Running;
                        c.running = true;
                        lines.push(format!("Container {} Started", c.name));
                    }
                }
            }
            ComposeAction::Pull => {
                for (service, _) in services {
                    lines.push(format!("{} Pulled", service));
                }
            }
        }
        Ok(LineStream::from_lines(lines, Ok(())))
    }
}

/// Everything a workflow test needs, wired against the mock engine.
pub struct Harness {
    pub engine: MockEngine,
    pub state: Arc<StateManager>,
    pub workflows: Workflows,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let engine = MockEngine::new();
        let state = Arc::new(StateManager::new_in_memory().await.unwrap());
        let store: Arc<dyn MetadataStore> = state.clone();
        let backups = BackupManager::new(Arc::clone(&store), dir.path().join("backups"));
        let stacks = StackDriver::new(Arc::new(engine.clone()), dir.path().join("stacks"));
        let workflows = Workflows::new(
            Arc::new(engine.clone()),
            store,
            Arc::new(LogAuditSink),
            backups,
            stacks,
            WorkflowSettings::default(),
        );
        Self { engine, state, workflows, dir }
    }

    /// A running, managed container with the given bind mounts.
    pub async fn managed(&self, name: &str, image: &str, binds: &[(&str, &str)]) -> ContainerRecord {
        self.engine.add_image(image);
        let mut spec = ContainerSpec::new(name, image);
        for (source, destination) in binds {
            spec.mounts.push(stardeck_core::types::Mount::bind(*source, *destination));
        }
        spec.env.push("MODE=production".to_string());
        spec.labels.insert("app.tier".to_string(), "frontend".to_string());
        spec.ports.push(stardeck_core::types::PortBinding {
            host_ip: None,
            host_port: Some(8080),
            container_port: 80,
            protocol: Default::default(),
        });
        let engine_id = self.engine.add_running(spec);

        let mut record = ContainerRecord::new(engine_id, name, image);
        record.status = ContainerStatus::Running;
        self.state.insert_container(&record).await.unwrap();
        record
    }

    /// A host directory with a couple of files, for bind mounts.
    pub fn host_dir(&self, name: &str) -> String {
        let path = self.dir.path().join("host").join(name);
        std::fs::create_dir_all(path.join("nested")).unwrap();
        std::fs::write(path.join("config.toml"), "port = 8080\n").unwrap();
        std::fs::write(path.join("nested").join("data.db"), vec![7u8; 4096]).unwrap();
        path.to_string_lossy().to_string()
    }
}

pub fn reporter() -> (ProgressReporter, ProgressStream) {
    progress::channel(1024, Duration::from_millis(200))
}

/// Step names in order, with consecutive repeats collapsed.
pub fn step_sequence(events: &[ProgressEvent]) -> Vec<String> {
    let mut steps: Vec<String> = Vec::new();
    for event in events {
        let step = event.step().as_str().to_string();
        if steps.last() != Some(&step) {
            steps.push(step);
        }
    }
    steps
}
