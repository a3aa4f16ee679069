//! Core domain types for Stardeck.

pub mod backup;
pub mod container;
pub mod resources;
pub mod stack;

// Re-exports
pub use backup::{BackupManifest, BackupMountEntry, BackupRecord};
pub use container::{
    ContainerDetails, ContainerRecord, ContainerSpec, ContainerStats, ContainerStatus,
    ContainerSummary, ImageDetails, Mount, MountType, PortBinding, Protocol, ResourceLimits,
    RestartPolicy, WebUi,
};
pub use resources::{ImageSummary, NetworkSummary, ResourceCreate, VolumeSummary};
pub use stack::{StackRecord, StackStatus};
