//! Event types broadcast by the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DependencyHash, FailureReason, JobId, JobStatus};

/// Events emitted while jobs move through the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    // Job events
    /// A new job was accepted.
    JobEnqueued {
        job_id: JobId,
        payload_reference: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker claimed a job.
    JobClaimed {
        job_id: JobId,
        worker_id: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// A job's status changed.
    JobStatusChanged {
        job_id: JobId,
        old_status: JobStatus,
        new_status: JobStatus,
        failure: Option<FailureReason>,
        timestamp: DateTime<Utc>,
    },
    /// A failed job was put back on the queue.
    JobRetrying {
        job_id: JobId,
        attempt: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },

    // Package events
    /// A dependency set finished installing.
    PackageInstalled {
        dependency_hash: DependencyHash,
        timestamp: DateTime<Utc>,
    },
    /// A dependency set failed to install.
    PackageFailed {
        dependency_hash: DependencyHash,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A job gave back its reference to a dependency set.
    PackageReleased {
        dependency_hash: DependencyHash,
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    /// Garbage collection evicted a dependency set.
    PackageEvicted {
        dependency_hash: DependencyHash,
        timestamp: DateTime<Utc>,
    },

    // Container events
    /// A sibling container started.
    ContainerStarted {
        job_id: JobId,
        runtime_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A sibling container was removed.
    ContainerRemoved {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },

    /// A reconcile sweep finished with at least one repair.
    ReconcileCompleted {
        repairs: usize,
        timestamp: DateTime<Utc>,
    },
}

impl OrchestratorEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            OrchestratorEvent::JobEnqueued { timestamp, .. } => *timestamp,
            OrchestratorEvent::JobClaimed { timestamp, .. } => *timestamp,
            OrchestratorEvent::JobStatusChanged { timestamp, .. } => *timestamp,
            OrchestratorEvent::JobRetrying { timestamp, .. } => *timestamp,
            OrchestratorEvent::PackageInstalled { timestamp, .. } => *timestamp,
            OrchestratorEvent::PackageFailed { timestamp, .. } => *timestamp,
            OrchestratorEvent::PackageReleased { timestamp, .. } => *timestamp,
            OrchestratorEvent::PackageEvicted { timestamp, .. } => *timestamp,
            OrchestratorEvent::ContainerStarted { timestamp, .. } => *timestamp,
            OrchestratorEvent::ContainerRemoved { timestamp, .. } => *timestamp,
            OrchestratorEvent::ReconcileCompleted { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            OrchestratorEvent::JobEnqueued { job_id, .. }
            | OrchestratorEvent::JobClaimed { job_id, .. }
            | OrchestratorEvent::JobStatusChanged { job_id, .. }
            | OrchestratorEvent::JobRetrying { job_id, .. }
            | OrchestratorEvent::PackageReleased { job_id, .. }
            | OrchestratorEvent::ContainerStarted { job_id, .. }
            | OrchestratorEvent::ContainerRemoved { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            OrchestratorEvent::JobEnqueued {
                job_id,
                payload_reference,
                ..
            } => format!("Job {} enqueued for {}", job_id, payload_reference),
            OrchestratorEvent::JobClaimed {
                job_id,
                worker_id,
                attempt,
                ..
            } => format!("Job {} claimed by {} (attempt {})", job_id, worker_id, attempt),
            OrchestratorEvent::JobStatusChanged {
                job_id,
                new_status,
                failure,
                ..
            } => match failure {
                Some(reason) => format!("Job {} -> {} ({})", job_id, new_status, reason),
                None => format!("Job {} -> {}", job_id, new_status),
            },
            OrchestratorEvent::JobRetrying {
                job_id, attempt, ..
            } => format!("Job {} retrying (attempt {})", job_id, attempt),
            OrchestratorEvent::PackageInstalled {
                dependency_hash, ..
            } => format!("Package {} installed", dependency_hash),
            OrchestratorEvent::PackageFailed {
                dependency_hash,
                error,
                ..
            } => format!("Package {} failed: {}", dependency_hash, error),
            OrchestratorEvent::PackageReleased {
                dependency_hash,
                job_id,
                ..
            } => format!("Job {} released package {}", job_id, dependency_hash),
            OrchestratorEvent::PackageEvicted {
                dependency_hash, ..
            } => format!("Package {} evicted", dependency_hash),
            OrchestratorEvent::ContainerStarted {
                job_id, runtime_id, ..
            } => format!("Container {} started for job {}", runtime_id, job_id),
            OrchestratorEvent::ContainerRemoved { job_id, .. } => {
                format!("Container for job {} removed", job_id)
            }
            OrchestratorEvent::ReconcileCompleted { repairs, .. } => {
                format!("Reconcile sweep made {} repairs", repairs)
            }
        }
    }
}
