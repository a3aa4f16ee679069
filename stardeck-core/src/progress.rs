//! Progress reporting for streamed workflows.
//!
//! A workflow owns a `ProgressReporter`; the transport owns the matching `ProgressStream`.
//! Events are delivered in emission order through a bounded queue. A slow consumer costs
//! the workflow at most `send_timeout` per event, and a consumer that went away turns the
//! reporter into a no-op: reporting never fails the workflow.

use crate::engine::LineStream;
use crate::error::{Result, StardeckError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace, warn};

/// Workflow steps, as named on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Validate,
    Config,
    Backup,
    Pull,
    Stop,
    Rename,
    Create,
    Start,
    Metadata,
    Cleanup,
    Rollback,
    Render,
    Compose,
    Status,
    Complete,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Config => "config",
            Self::Backup => "backup",
            Self::Pull => "pull",
            Self::Stop => "stop",
            Self::Rename => "rename",
            Self::Create => "create",
            Self::Start => "start",
            Self::Metadata => "metadata",
            Self::Cleanup => "cleanup",
            Self::Rollback => "rollback",
            Self::Render => "render",
            Self::Compose => "compose",
            Self::Status => "status",
            Self::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a finished workflow produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Renamed original, when it was retained
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_status: Option<String>,
}

/// Terminal outcome of a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub success: bool,
    pub error: Option<String>,
    pub failed_step: Option<Step>,
    pub warnings: Vec<String>,
    pub result: OperationResult,
}

impl Completion {
    pub fn success(result: OperationResult, warnings: Vec<String>) -> Self {
        Self { success: true, error: None, failed_step: None, warnings, result }
    }

    /// Failure outcome; the failing step is taken from the error when it names one.
    pub fn failure(err: &StardeckError, result: OperationResult) -> Self {
        let failed_step = match err {
            StardeckError::StepFailed { step, .. } | StardeckError::RollbackFailed { step, .. } => {
                Step::parse(step)
            }
            _ => None,
        };
        Self {
            success: false,
            error: Some(err.to_string()),
            failed_step,
            warnings: Vec::new(),
            result,
        }
    }
}

/// One progress event. Each kind carries only the fields relevant to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Step { step: Step, message: String, is_error: bool },
    Progress { step: Step, message: String, percent: u8 },
    BackupCreated { backup_id: String, path: String, size_bytes: u64 },
    Renamed { backup_name: String },
    Created { engine_id: String },
    Warning { step: Step, message: String },
    Complete(Completion),
}

impl ProgressEvent {
    pub fn step(&self) -> Step {
        match self {
            Self::Step { step, .. } | Self::Progress { step, .. } | Self::Warning { step, .. } => {
                *step
            }
            Self::BackupCreated { .. } => Step::Backup,
            Self::Renamed { .. } => Step::Rename,
            Self::Created { .. } => Step::Create,
            Self::Complete(_) => Step::Complete,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    pub fn is_error(&self) -> bool {
        match self {
            Self::Step { is_error, .. } => *is_error,
            Self::Complete(c) => !c.success,
            _ => false,
        }
    }

    /// Serialize to the wire shape `{step, message, error, progress?, ...fields}`.
    pub fn to_wire(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("step".to_string(), json!(self.step().as_str()));
        match self {
            Self::Step { message, is_error, .. } => {
                obj.insert("message".to_string(), json!(message));
                obj.insert("error".to_string(), json!(is_error));
            }
            Self::Progress { message, percent, .. } => {
                obj.insert("message".to_string(), json!(message));
                obj.insert("error".to_string(), json!(false));
                obj.insert("progress".to_string(), json!((*percent).min(100)));
            }
            Self::BackupCreated { backup_id, path, size_bytes } => {
                obj.insert("message".to_string(), json!(format!("Backup created at {}", path)));
                obj.insert("error".to_string(), json!(false));
                obj.insert("backupId".to_string(), json!(backup_id));
                obj.insert("backupPath".to_string(), json!(path));
                obj.insert("sizeBytes".to_string(), json!(size_bytes));
            }
            Self::Renamed { backup_name } => {
                obj.insert(
                    "message".to_string(),
                    json!(format!("Renamed original container to {}", backup_name)),
                );
                obj.insert("error".to_string(), json!(false));
                obj.insert("backupContainer".to_string(), json!(backup_name));
            }
            Self::Created { engine_id } => {
                obj.insert("message".to_string(), json!("Created replacement container"));
                obj.insert("error".to_string(), json!(false));
                obj.insert("engineId".to_string(), json!(engine_id));
            }
            Self::Warning { message, .. } => {
                obj.insert("message".to_string(), json!(message));
                obj.insert("error".to_string(), json!(false));
                obj.insert("warning".to_string(), json!(true));
            }
            Self::Complete(c) => {
                let message = if c.success {
                    "Operation completed successfully".to_string()
                } else {
                    "Operation failed".to_string()
                };
                obj.insert("message".to_string(), json!(message));
                obj.insert("complete".to_string(), json!(true));
                obj.insert("success".to_string(), json!(c.success));
                match &c.error {
                    Some(detail) => obj.insert("error".to_string(), json!(detail)),
                    None => obj.insert("error".to_string(), json!(false)),
                };
                if let Some(step) = c.failed_step {
                    obj.insert("failedStep".to_string(), json!(step.as_str()));
                }
                if !c.warnings.is_empty() {
                    obj.insert("warnings".to_string(), json!(c.warnings));
                }
                if let Ok(Value::Object(fields)) = serde_json::to_value(&c.result) {
                    obj.extend(fields);
                }
            }
        }
        Value::Object(obj)
    }
}

struct Inner {
    tx: mpsc::Sender<ProgressEvent>,
    send_timeout: Duration,
    detached: AtomicBool,
    /// Set after a send timed out; cleared once the queue accepts an event again.
    lagging: AtomicBool,
    dropped: AtomicU64,
}

/// Producer side of a progress channel.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Option<Arc<Inner>>,
}

/// Consumer side of a progress channel.
pub struct ProgressStream {
    rx: mpsc::Receiver<ProgressEvent>,
}

/// Create a bounded progress channel.
pub fn channel(capacity: usize, send_timeout: Duration) -> (ProgressReporter, ProgressStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let inner = Inner {
        tx,
        send_timeout,
        detached: AtomicBool::new(false),
        lagging: AtomicBool::new(false),
        dropped: AtomicU64::new(0),
    };
    (ProgressReporter { inner: Some(Arc::new(inner)) }, ProgressStream { rx })
}

impl ProgressReporter {
    /// A reporter that discards everything (request/response callers).
    pub fn noop() -> Self {
        Self { inner: None }
    }

    /// Whether a consumer is still attached.
    pub fn is_attached(&self) -> bool {
        self.inner.as_ref().is_some_and(|i| !i.detached.load(Ordering::Relaxed))
    }

    /// Events dropped because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.inner.as_ref().map(|i| i.dropped.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub async fn emit(&self, event: ProgressEvent) {
        trace!(step = %event.step(), "progress event");
        let Some(inner) = &self.inner else { return };
        if inner.detached.load(Ordering::Relaxed) {
            return;
        }
        Self::deliver(inner, event, inner.send_timeout, false).await;
    }

    /// A lagging consumer costs at most one wait: later events are only offered with
    /// `try_send` until the queue has room again. `finish` always waits.
    async fn deliver(inner: &Inner, event: ProgressEvent, wait: Duration, terminal: bool) {
        let event = match inner.tx.try_send(event) {
            Ok(()) => {
                inner.lagging.store(false, Ordering::Relaxed);
                return;
            }
            Err(TrySendError::Closed(_)) => {
                Self::detach(inner);
                return;
            }
            Err(TrySendError::Full(event)) => event,
        };
        if !terminal && inner.lagging.load(Ordering::Relaxed) {
            inner.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match tokio::time::timeout(wait, inner.tx.send(event)).await {
            Ok(Ok(())) => inner.lagging.store(false, Ordering::Relaxed),
            Ok(Err(_)) => Self::detach(inner),
            Err(_) => {
                inner.dropped.fetch_add(1, Ordering::Relaxed);
                if !inner.lagging.swap(true, Ordering::Relaxed) {
                    warn!("progress consumer is not keeping up; dropping events until it catches up");
                }
            }
        }
    }

    fn detach(inner: &Inner) {
        if !inner.detached.swap(true, Ordering::Relaxed) {
            debug!("progress consumer went away; workflow continues without reporting");
        }
    }

    pub async fn step(&self, step: Step, message: impl Into<String>) {
        self.emit(ProgressEvent::Step { step, message: message.into(), is_error: false }).await;
    }

    pub async fn error(&self, step: Step, message: impl Into<String>) {
        self.emit(ProgressEvent::Step { step, message: message.into(), is_error: true }).await;
    }

    pub async fn progress(&self, step: Step, message: impl Into<String>, percent: u8) {
        self.emit(ProgressEvent::Progress { step, message: message.into(), percent }).await;
    }

    pub async fn warning(&self, step: Step, message: impl Into<String>) {
        self.emit(ProgressEvent::Warning { step, message: message.into() }).await;
    }

    /// Relay every line of an engine stream as a step message, then return its outcome.
    pub async fn relay(&self, step: Step, mut lines: LineStream) -> Result<()> {
        while let Some(line) = lines.next_line().await {
            let line = line.trim();
            if !line.is_empty() {
                self.step(step, line).await;
            }
        }
        lines.finish().await
    }

    /// Send the terminal event. Waits longer than `emit` so the outcome is not lost to a
    /// momentary backlog.
    pub async fn finish(&self, completion: Completion) {
        let Some(inner) = &self.inner else { return };
        if inner.detached.load(Ordering::Relaxed) {
            return;
        }
        Self::deliver(inner, ProgressEvent::Complete(completion), inner.send_timeout * 4, true).await;
    }
}

impl ProgressStream {
    /// Next event, or `None` once every reporter is gone and the queue is drained.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<ProgressEvent> {
        ReceiverStream::new(self.rx)
    }

    /// Drain until the producer side closes.
    pub async fn collect(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}
