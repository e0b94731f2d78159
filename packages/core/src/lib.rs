//! Core domain types for the sibling container orchestrator.
//!
//! This crate contains shared types used across all packages:
//! - Job, JobStatus and FailureReason for agent payload runs
//! - DependencySpec and PackageEntry for the shared package cache
//! - ContainerHandle and Mount for sibling containers
//! - Queue messages and orchestrator events

mod artifact;
mod container;
mod events;
mod job;
mod message;
mod package;

pub use artifact::ArtifactRecord;
pub use container::{
    ContainerHandle, JOB_ID_LABEL, MANAGED_LABEL, Mount, PAYLOAD_LABEL, container_name,
};
pub use events::OrchestratorEvent;
pub use job::{
    FailureReason, Job, JobId, JobStatus, JobSubmission, ResourceLimits, SubmissionError,
};
pub use message::{Delivery, DeliveryId, QueueMessage};
pub use package::{DependencyHash, DependencySpec, PackageEntry, PackageState};
