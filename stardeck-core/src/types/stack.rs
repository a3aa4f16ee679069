//! Stack domain types (Compose).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Multi-container stack defined by one compose document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackRecord {
    pub id: String,

    /// Globally unique; also the engine-side project name
    pub name: String,

    pub compose_content: String,

    /// Empty when the stack has no environment file
    pub env_content: String,

    /// Directory holding the rendered compose/env files
    pub path: String,

    pub status: StackStatus,

    pub created_by: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Aggregate state of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackStatus {
    Stopped,
    /// Every container is running
    Active,
    /// Some, but not all, containers are running
    Partial,
    Deploying,
    Error,
}

impl StackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Active => "active",
            Self::Partial => "partial",
            Self::Deploying => "deploying",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(Self::Stopped),
            "active" => Some(Self::Active),
            "partial" => Some(Self::Partial),
            "deploying" => Some(Self::Deploying),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Reduce container counts to a stack status.
    ///
    /// 0 containers or none running is `Stopped`, all running is `Active`, otherwise `Partial`.
    pub fn from_counts(total: usize, running: usize) -> Self {
        if total == 0 || running == 0 {
            Self::Stopped
        } else if running >= total {
            Self::Active
        } else {
            Self::Partial
        }
    }
}

impl std::fmt::Display for StackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
