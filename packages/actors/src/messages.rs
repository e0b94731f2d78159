//! Message types for actor communication.

use orchestrator_core::{Delivery, DeliveryId, Job, JobId, JobSubmission, OrchestratorEvent};
use ractor::RpcReplyPort;
use runtime::CancelOutcome;
use tokio::sync::broadcast;

use crate::reconciler::ReconcileReport;
use crate::supervisor::FlushReport;

/// Messages for the CoordinatorActor.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// Accept a submission. Replies with the (possibly pre-existing) job id.
    Enqueue {
        submission: Box<JobSubmission>,
        reply: RpcReplyPort<Result<JobId, String>>,
    },

    /// Hand out the next visible message, if any.
    Dequeue { reply: RpcReplyPort<Option<Delivery>> },

    /// The delivery was consumed.
    Ack { delivery_id: DeliveryId },

    /// The delivery was not consumed; make it visible again right away.
    Nack { delivery_id: DeliveryId },

    /// A retryable failure; re-queue the job with backoff.
    Retry { job_id: JobId },

    /// Cancel a job.
    Cancel {
        job_id: JobId,
        reply: RpcReplyPort<Result<CancelOutcome, String>>,
    },

    /// Stop dispatching; submissions are still accepted.
    Quiesce,

    /// Dispatch again after a quiesce.
    Resume,

    /// Get queue stats.
    GetStats { reply: RpcReplyPort<CoordinatorStats> },

    /// Periodic tick for housekeeping.
    Tick,
}

/// Snapshot of the coordinator's in-memory queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub pending: usize,
    pub in_flight: usize,
    pub quiesced: bool,
}

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Process one delivery end to end.
    Process { delivery: Box<Delivery> },

    /// Shutdown the worker.
    Shutdown,
}

/// Messages for the ReconcilerActor.
#[derive(Debug)]
pub enum ReconcilerMessage {
    /// Run a sweep; the reply is optional so timers can trigger it too.
    Sweep {
        reply: Option<RpcReplyPort<Result<ReconcileReport, String>>>,
    },

    /// Evict unreferenced packages.
    CollectGarbage {
        reply: Option<RpcReplyPort<Result<usize, String>>>,
    },
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    Submit {
        submission: Box<JobSubmission>,
        reply: RpcReplyPort<Result<JobId, String>>,
    },

    Cancel {
        job_id: JobId,
        reply: RpcReplyPort<Result<CancelOutcome, String>>,
    },

    GetJob {
        job_id: JobId,
        reply: RpcReplyPort<Result<Option<Job>, String>>,
    },

    /// Quiesce, drain, tear down and purge, then resume.
    Flush {
        reply: RpcReplyPort<Result<FlushReport, String>>,
    },

    /// Run a reconcile sweep now.
    Reconcile {
        reply: RpcReplyPort<Result<ReconcileReport, String>>,
    },

    /// Run garbage collection now.
    CollectGarbage {
        reply: RpcReplyPort<Result<usize, String>>,
    },

    /// Subscribe to events.
    Subscribe {
        reply: RpcReplyPort<broadcast::Receiver<OrchestratorEvent>>,
    },

    GetStats { reply: RpcReplyPort<CoordinatorStats> },

    /// Shutdown everything.
    Shutdown,
}

/// Result type for internal operations.
pub type ActorResult<T> = Result<T, ActorError>;

/// Error type for actor operations.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error("invalid orchestrator config: {0}")]
    InvalidConfig(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Database error: {0}")]
    Database(#[from] db::DbError),

    #[error("Cache error: {0}")]
    Cache(#[from] cache::CacheError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] runtime::LifecycleError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Timeout")]
    Timeout,
}
