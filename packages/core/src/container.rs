//! Sibling container types.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, ResourceLimits};

/// Label marking containers created by this system.
pub const MANAGED_LABEL: &str = "sibling.managed";
/// Label carrying the owning job id.
pub const JOB_ID_LABEL: &str = "sibling.job_id";
/// Label carrying the payload reference.
pub const PAYLOAD_LABEL: &str = "sibling.payload";

/// Deterministic container name for a job.
pub fn container_name(job_id: JobId) -> String {
    format!("sibling-{}", job_id.to_string().to_lowercase())
}

/// A bind mount from the host into a sibling container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Path on the host running the container runtime.
    pub source: PathBuf,
    /// Path inside the sibling container.
    pub target: PathBuf,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }

    pub fn read_write(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }
}

/// A job's claim on one container in the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub job_id: JobId,
    /// Id assigned by the runtime.
    pub runtime_id: String,
    /// Deterministic name, usable when the id is unknown.
    pub name: String,
    pub mounts: Vec<Mount>,
    pub resource_limits: ResourceLimits,
    pub started_at: DateTime<Utc>,
}
