//! Worker actor for executing jobs.

use std::sync::Arc;

use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::mpsc;

use crate::messages::{CoordinatorMessage, WorkerMessage};
use crate::pipeline::{JobPipeline, PipelineOutcome};

/// State for the worker actor.
pub struct WorkerActorState {
    /// Recorded as `owning_worker` on claimed jobs.
    pub worker_id: String,
    pub coordinator: ActorRef<CoordinatorMessage>,
    pub pipeline: Arc<JobPipeline>,
    /// Where the worker announces it can take another delivery.
    idle_tx: mpsc::Sender<ActorRef<WorkerMessage>>,
    pub processed: u64,
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub coordinator: ActorRef<CoordinatorMessage>,
    pub pipeline: Arc<JobPipeline>,
    pub idle_tx: mpsc::Sender<ActorRef<WorkerMessage>>,
}

/// Worker actor that runs one job at a time.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(worker = %args.worker_id, "Starting worker");

        args.idle_tx
            .send(myself)
            .await
            .map_err(|_| ActorProcessingErr::from("dispatcher is gone"))?;

        Ok(WorkerActorState {
            worker_id: args.worker_id,
            coordinator: args.coordinator,
            pipeline: args.pipeline,
            idle_tx: args.idle_tx,
            processed: 0,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Process { delivery } => {
                let job_id = delivery.job_id();
                let outcome = state
                    .pipeline
                    .run(&state.worker_id, *delivery, &state.coordinator)
                    .await;
                if let PipelineOutcome::Finished(Some(job)) = &outcome {
                    state.processed += 1;
                    tracing::debug!(
                        worker = %state.worker_id,
                        job_id = %job_id,
                        status = %job.status,
                        "Worker finished job"
                    );
                }

                if state.idle_tx.send(myself.clone()).await.is_err() {
                    tracing::debug!(worker = %state.worker_id, "Dispatcher gone; stopping worker");
                    myself.stop(None);
                }
            }

            WorkerMessage::Shutdown => {
                tracing::info!(
                    worker = %state.worker_id,
                    processed = state.processed,
                    "Worker shutting down"
                );
                myself.stop(None);
            }
        }

        Ok(())
    }
}
