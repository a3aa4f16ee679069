//! Error types for Stardeck.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Stardeck operations.
pub type Result<T> = std::result::Result<T, StardeckError>;

/// Main error type for Stardeck.
#[derive(Error, Debug)]
pub enum StardeckError {
    // Lookup errors
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Name or port already in use, or another operation holds the resource.
    #[error("Conflict: {reason}")]
    Conflict { reason: String },

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Container engine unavailable: {reason}")]
    EngineUnavailable { reason: String },

    #[error("Validation failed: {reason}")]
    ValidationFailed { reason: String },

    /// Operation succeeded, but with non-fatal warnings.
    #[error("Completed with warnings: {}", warnings.join("; "))]
    PartialFailure { warnings: Vec<String> },

    /// The engine rejected an operation. `detail` is the engine's error text verbatim.
    #[error("{operation} failed: {detail}")]
    Engine { operation: String, detail: String },

    // Workflow errors
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: Box<StardeckError>,
    },

    #[error("step '{step}' failed: {cause}; rollback also failed: {rollback}")]
    RollbackFailed { step: String, cause: String, rollback: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Database errors
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Database migration failed: {reason}")]
    MigrationFailed { reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StardeckError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict { reason: reason.into() }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationFailed { reason: reason.into() }
    }

    /// Wrap this error with the name of the workflow step that produced it.
    pub fn at_step(self, step: impl Into<String>) -> Self {
        Self::StepFailed { step: step.into(), source: Box::new(self) }
    }

    /// The innermost error, looking through `StepFailed` wrappers.
    pub fn root(&self) -> &StardeckError {
        match self {
            Self::StepFailed { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Self::Conflict { .. })
    }
}
