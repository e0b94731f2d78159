//! Actor system for the orchestrator.
//!
//! This crate provides the Ractor-based actors that move jobs from
//! submission to a finished container run.
//!
//! # Architecture
//!
//! - `Supervisor` - Top-level actor; owns the others and restarts failed workers
//! - `CoordinatorActor` - Intake, visibility-window redelivery and retry
//! - `WorkerActor` - Runs one job at a time through the `JobPipeline`
//! - `ReconcilerActor` - Periodic drift repair and cache garbage collection
//!
//! # Usage
//!
//! ```ignore
//! use actors::{OrchestratorConfig, SupervisorArgs, start_supervisor};
//!
//! let (supervisor, handle) = start_supervisor(SupervisorArgs { ... }).await?;
//! let job_id = supervisor.submit(submission).await?;
//! ```

mod config;
mod coordinator;
mod dispatch;
mod messages;
mod pipeline;
mod reconciler;
mod supervisor;
mod worker;

pub use config::OrchestratorConfig;
pub use coordinator::{CoordinatorActor, CoordinatorArgs};
pub use dispatch::{Dispatch, dispatch};
pub use messages::{
    ActorError, ActorResult, CoordinatorMessage, CoordinatorStats, ReconcilerMessage,
    SupervisorMessage, WorkerMessage,
};
pub use pipeline::{JobPipeline, LOG_ARTIFACT, PipelineOutcome};
pub use reconciler::{ReconcileReport, Reconciler, ReconcilerActor, ReconcilerArgs};
pub use supervisor::{FlushReport, Supervisor, SupervisorArgs, SupervisorHandle, start_supervisor};
pub use worker::{WorkerActor, WorkerArgs};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
