//! Stardeck Core Library
//!
//! Container and stack lifecycle orchestration over an existing container engine:
//! the engine adapter, the update orchestrator, backups, compose stacks and the
//! progress stream that reports on all of them.

pub mod audit;
pub mod backup;
pub mod config;
pub mod engine;
pub mod error;
pub mod locks;
pub mod observability;
pub mod paths;
pub mod progress;
pub mod stack;
pub mod state;
pub mod store;
pub mod types;
pub mod update;
pub mod workflows;

// Re-export commonly used items
pub use audit::{Actor, AuditEvent, AuditSink, LogAuditSink};
pub use backup::BackupManager;
pub use config::Config;
pub use engine::{ContainerEngine, DockerCli, ExecSession, LineStream};
pub use error::{Result, StardeckError};
pub use observability::{
    health::HealthChecker, init as init_observability, shutdown as shutdown_observability,
};
pub use progress::{Completion, OperationResult, ProgressEvent, ProgressReporter, Step};
pub use stack::StackDriver;
pub use state::StateManager;
pub use store::MetadataStore;
pub use types::{
    BackupRecord, ContainerDetails, ContainerRecord, ContainerSpec, ContainerStatus, StackRecord,
    StackStatus,
};
pub use update::{UpdateOrchestrator, UpdateOutcome, UpdateRequest};
pub use workflows::{Operation, WorkflowSettings, Workflows};
