//! Job domain types for agent payload executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::container::ContainerHandle;
use crate::package::{DependencyHash, DependencySpec};

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current status of a job in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker.
    #[default]
    Queued,
    /// Claimed; dependencies are being resolved and the container created.
    Provisioning,
    /// The sibling container is running.
    Running,
    /// The container exited with code 0.
    Succeeded,
    /// The job failed; see [`Job::failure`].
    Failed,
    /// The job was canceled.
    Canceled,
}

impl JobStatus {
    /// Statuses in which a job may still own a container.
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Provisioning, JobStatus::Running];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Check if the job is being worked on.
    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    /// Whether moving from `self` to `next` respects the lifecycle ordering.
    ///
    /// The only backwards edge is `failed -> queued`, which callers must
    /// additionally gate on the attempt budget.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Provisioning | Canceled) => true,
            (Provisioning, Provisioning | Running | Failed | Canceled) => true,
            (Running, Succeeded | Failed | Canceled) => true,
            (Failed, Queued) => true,
            _ => false,
        }
    }

    /// Get a simple status string for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Provisioning => "provisioning",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured reason code recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// The container outlived its `timeout_secs` limit.
    Timeout,
    /// The container exited with a non-zero code.
    ExitCode { code: i64 },
    /// The runtime rejected a create/start/wait call.
    RuntimeError { message: String },
    /// The container did not reach `running` within the provisioning timeout.
    ProvisionTimeout,
    /// Installing the dependency set failed.
    DependencyInstall { message: String },
    /// Infrastructure was temporarily unavailable (runtime, lease, datastore).
    TransientInfra { message: String },
    /// The container disappeared from the runtime while the job was running.
    ContainerLost,
    /// The job carried no usable resource limits.
    MissingLimits,
}

impl FailureReason {
    /// Whether the job may be re-queued for another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::TransientInfra { .. } | FailureReason::DependencyInstall { .. }
        )
    }

    /// Short reason code for logs and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::ExitCode { .. } => "exit_code",
            FailureReason::RuntimeError { .. } => "runtime_error",
            FailureReason::ProvisionTimeout => "provision_timeout",
            FailureReason::DependencyInstall { .. } => "dependency_install",
            FailureReason::TransientInfra { .. } => "transient_infra",
            FailureReason::ContainerLost => "container_lost",
            FailureReason::MissingLimits => "missing_limits",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::ExitCode { code } => write!(f, "exit_code({})", code),
            FailureReason::RuntimeError { message }
            | FailureReason::DependencyInstall { message }
            | FailureReason::TransientInfra { message } => {
                write!(f, "{}: {}", self.code(), message)
            }
            other => f.write_str(other.code()),
        }
    }
}

/// CPU, memory and wall-clock limits applied to a sibling container.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU cores (fractional allowed).
    pub cpu: f64,
    /// Memory limit in MiB.
    pub memory_mb: u64,
    /// Maximum execution time in seconds.
    pub timeout_secs: u64,
}

impl ResourceLimits {
    pub fn new(cpu: f64, memory_mb: u64, timeout_secs: u64) -> Self {
        Self {
            cpu,
            memory_mb,
            timeout_secs,
        }
    }

    /// All limits must be strictly positive.
    pub fn is_valid(&self) -> bool {
        self.cpu.is_finite() && self.cpu > 0.0 && self.memory_mb > 0 && self.timeout_secs > 0
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

/// A job submission as received from the API collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSubmission {
    /// Caller-supplied key making submission idempotent.
    pub idempotency_key: String,
    /// Reference to the agent payload to run.
    pub payload_reference: String,
    /// Dependency lines, one requirement per entry.
    #[serde(default)]
    pub dependency_spec: Vec<String>,
    /// Mandatory at provision time; absence is tolerated at intake.
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
}

impl JobSubmission {
    pub fn new(idempotency_key: impl Into<String>, payload_reference: impl Into<String>) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            payload_reference: payload_reference.into(),
            dependency_spec: Vec::new(),
            resource_limits: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependency_spec = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = Some(limits);
        self
    }

    /// Check the shape of the submission.
    pub fn validate(&self) -> Result<(), SubmissionError> {
        if self.idempotency_key.trim().is_empty() {
            return Err(SubmissionError::MissingIdempotencyKey);
        }
        if self.payload_reference.trim().is_empty() {
            return Err(SubmissionError::MissingPayload);
        }
        Ok(())
    }
}

/// Rejections at intake.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmissionError {
    #[error("idempotency key must not be empty")]
    MissingIdempotencyKey,
    #[error("payload reference must not be empty")]
    MissingPayload,
}

/// A job represents one unit of agent-payload execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Key the job was submitted under.
    pub idempotency_key: String,
    /// Reference to the agent payload.
    pub payload_reference: String,
    /// Normalized dependency specification.
    pub dependency_spec: DependencySpec,
    /// Hash of `dependency_spec`, the package cache key.
    pub dependency_hash: DependencyHash,
    /// Limits applied to the container.
    pub resource_limits: Option<ResourceLimits>,
    /// Current status.
    pub status: JobStatus,
    /// Reason code when `status` is `failed`.
    #[serde(default)]
    pub failure: Option<FailureReason>,
    /// Exit code reported by the runtime, when the container exited.
    #[serde(default)]
    pub exit_code: Option<i64>,
    /// Number of claims so far.
    #[serde(default)]
    pub attempt_count: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Worker currently owning the job.
    #[serde(default)]
    pub owning_worker: Option<String>,
    /// The job's single container slot.
    #[serde(default)]
    pub container: Option<ContainerHandle>,
    /// Set when a cancel arrives while the job is in flight.
    #[serde(default)]
    pub cancel_requested: bool,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new queued job from a submission.
    pub fn from_submission(submission: JobSubmission) -> Self {
        let now = Utc::now();
        let dependency_spec = DependencySpec::new(submission.dependency_spec);
        let dependency_hash = dependency_spec.hash();
        Self {
            id: JobId::new(),
            idempotency_key: submission.idempotency_key,
            payload_reference: submission.payload_reference,
            dependency_spec,
            dependency_hash,
            resource_limits: submission.resource_limits,
            status: JobStatus::Queued,
            failure: None,
            exit_code: None,
            attempt_count: 0,
            max_attempts: 3,
            owning_worker: None,
            container: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the attempt budget for this job.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Whether another attempt fits in the budget.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Build the broker message for the current attempt.
    pub fn message(&self) -> crate::QueueMessage {
        crate::QueueMessage {
            job_id: self.id,
            attempt: self.attempt_count + 1,
            payload_reference: self.payload_reference.clone(),
            dependency_hash: self.dependency_hash.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Provisioning.is_active());
    }

    #[test]
    fn transitions_are_monotonic_except_retry() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Provisioning));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Succeeded));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Succeeded.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Provisioning));
        assert!(!JobStatus::Canceled.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::Provisioning).unwrap();
        assert_eq!(json, "\"provisioning\"");
    }

    #[test]
    fn failure_reason_codes() {
        let reason = FailureReason::ExitCode { code: 2 };
        assert_eq!(reason.code(), "exit_code");
        assert!(!reason.is_retryable());
        assert!(
            FailureReason::TransientInfra {
                message: "docker down".into()
            }
            .is_retryable()
        );
        let json = serde_json::to_value(FailureReason::Timeout).unwrap();
        assert_eq!(json["reason"], "timeout");
    }

    #[test]
    fn limits_validation() {
        assert!(ResourceLimits::new(0.5, 256, 60).is_valid());
        assert!(!ResourceLimits::new(0.0, 256, 60).is_valid());
        assert!(!ResourceLimits::new(1.0, 0, 60).is_valid());
        assert!(!ResourceLimits::new(1.0, 256, 0).is_valid());
        assert!(!ResourceLimits::new(f64::NAN, 256, 5).is_valid());
    }

    #[test]
    fn submission_validation() {
        assert!(JobSubmission::new("k", "agent:1").validate().is_ok());
        assert_eq!(
            JobSubmission::new(" ", "agent:1").validate(),
            Err(SubmissionError::MissingIdempotencyKey)
        );
        assert_eq!(
            JobSubmission::new("k", "").validate(),
            Err(SubmissionError::MissingPayload)
        );
    }

    #[test]
    fn job_from_submission_hashes_dependencies() {
        let a = Job::from_submission(
            JobSubmission::new("a", "agent:1").with_dependencies(["requests==2.31", "click"]),
        );
        let b = Job::from_submission(
            JobSubmission::new("b", "agent:1").with_dependencies(["click", "requests==2.31"]),
        );
        assert_eq!(a.dependency_hash, b.dependency_hash);
        assert_eq!(a.status, JobStatus::Queued);
        assert_eq!(a.message().attempt, 1);
    }
}
