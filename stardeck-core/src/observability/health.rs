//! Health reporting.

use crate::engine::ContainerEngine;
use crate::state::StateManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

pub const DATABASE: &str = "database";
pub const ENGINE: &str = "engine";

/// Overall system health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub version: String,
    pub subsystems: Vec<SubsystemHealth>,
}

/// Subsystem health status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsystemHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

/// Tracks subsystem status.
#[derive(Clone, Default)]
pub struct HealthChecker {
    subsystems: Arc<RwLock<Vec<SubsystemHealth>>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_subsystem(&self, name: &str) {
        let mut subsystems = self.subsystems.write().await;
        if !subsystems.iter().any(|s| s.name == name) {
            subsystems.push(SubsystemHealth {
                name: name.to_string(),
                status: HealthStatus::Healthy,
                message: None,
            });
        }
    }

    pub async fn update_subsystem(&self, name: &str, status: HealthStatus, message: Option<String>) {
        let mut subsystems = self.subsystems.write().await;
        if let Some(subsystem) = subsystems.iter_mut().find(|s| s.name == name) {
            subsystem.status = status;
            subsystem.message = message;
        }
    }

    /// Any unhealthy subsystem makes the whole unhealthy; any degraded one, degraded.
    pub async fn get_health(&self) -> HealthCheck {
        let subsystems = self.subsystems.read().await.clone();

        let status = if subsystems.iter().any(|s| s.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if subsystems.iter().any(|s| s.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthCheck { status, version: env!("CARGO_PKG_VERSION").to_string(), subsystems }
    }

    pub async fn is_ready(&self) -> bool {
        self.get_health().await.status == HealthStatus::Healthy
    }

    /// Probe the database and the engine and record what they report.
    ///
    /// The engine being down degrades the service; reads of stored records still work.
    pub async fn probe(&self, state: &StateManager, engine: &dyn ContainerEngine) -> HealthCheck {
        match state.ping().await {
            Ok(()) => self.update_subsystem(DATABASE, HealthStatus::Healthy, None).await,
            Err(e) => {
                self.update_subsystem(DATABASE, HealthStatus::Unhealthy, Some(e.to_string())).await
            }
        }
        match engine.ping().await {
            Ok(version) => {
                let message = format!("{} {}", engine.name(), version);
                self.update_subsystem(ENGINE, HealthStatus::Healthy, Some(message)).await
            }
            Err(e) => {
                self.update_subsystem(ENGINE, HealthStatus::Degraded, Some(e.to_string())).await
            }
        }
        self.get_health().await
    }
}
