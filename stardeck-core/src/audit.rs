//! Audit events for mutating operations.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Identity of the caller, supplied by the transport's authentication layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub user_id: Option<String>,
    pub ip: Option<String>,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, ip: Option<String>) -> Self {
        Self { user_id: Some(user_id.into()), ip }
    }

    /// Internal actions (reconciliation, startup).
    pub fn system() -> Self {
        Self { user_id: Some("system".to_string()), ip: None }
    }
}

/// One audited action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// e.g. `container.update`, `stack.deploy`
    pub action: String,
    pub target: String,
    pub details: serde_json::Value,
    pub actor_id: Option<String>,
    pub actor_ip: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>, target: impl Into<String>, actor: &Actor) -> Self {
        Self {
            action: action.into(),
            target: target.into(),
            details: serde_json::Value::Null,
            actor_id: actor.user_id.clone(),
            actor_ip: actor.ip.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Destination for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<()>;
}

/// Audit sink that only writes to the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        log_event(&event);
        Ok(())
    }
}

pub(crate) fn log_event(event: &AuditEvent) {
    info!(
        target: "audit",
        action = %event.action,
        target_name = %event.target,
        actor = event.actor_id.as_deref().unwrap_or("-"),
        ip = event.actor_ip.as_deref().unwrap_or("-"),
        details = %event.details,
        "audit"
    );
}

/// Record an audit event; failures are logged, never returned.
pub async fn emit(sink: &Arc<dyn AuditSink>, event: AuditEvent) {
    let action = event.action.clone();
    if let Err(e) = sink.record(event).await {
        warn!(action = %action, "failed to record audit event: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_carries_actor() {
        let actor = Actor::new("alice", Some("10.0.0.7".to_string()));
        let event = AuditEvent::new("container.stop", "web", &actor)
            .with_details(serde_json::json!({"timeout": 30}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["actorId"], "alice");
        assert_eq!(json["actorIp"], "10.0.0.7");
        assert_eq!(json["details"]["timeout"], 30);
    }

    #[tokio::test]
    async fn log_sink_accepts_events() {
        let sink: Arc<dyn AuditSink> = Arc::new(LogAuditSink);
        emit(&sink, AuditEvent::new("stack.down", "blog", &Actor::system())).await;
    }
}
