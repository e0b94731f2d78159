//! Supervisor actor that wires the coordinator, reconciler and workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cache::PackageCache;
use db::Database;
use db::repositories::JobRepository;
use futures_util::StreamExt;
use orchestrator_core::{Job, JobId, JobStatus, JobSubmission, OrchestratorEvent};
use ractor::rpc::CallResult;
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use runtime::{CancelOutcome, LifecycleManager, MountPlan};
use storage::ArtifactStore;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::OrchestratorConfig;
use crate::coordinator::{CoordinatorActor, CoordinatorArgs};
use crate::dispatch::dispatch;
use crate::messages::{
    ActorError, ActorResult, CoordinatorMessage, CoordinatorStats, ReconcilerMessage,
    SupervisorMessage, WorkerMessage,
};
use crate::pipeline::JobPipeline;
use crate::reconciler::{ReconcileReport, Reconciler, ReconcilerActor, ReconcilerArgs};
use crate::worker::{WorkerActor, WorkerArgs};

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// What a flush did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// Jobs a cancel was issued for.
    pub canceled: usize,
    /// Containers removed after the drain.
    pub torn_down: usize,
    /// Jobs whose container slot was emptied.
    pub cleared_slots: usize,
}

/// Everything the supervisor needs to start the system.
pub struct SupervisorArgs {
    pub config: OrchestratorConfig,
    pub db: Database,
    pub cache: Arc<PackageCache>,
    pub lifecycle: Arc<LifecycleManager>,
    pub artifacts: ArtifactStore,
    pub mounts: MountPlan,
    pub events: broadcast::Sender<OrchestratorEvent>,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    config: OrchestratorConfig,
    jobs: JobRepository,
    coordinator: ActorRef<CoordinatorMessage>,
    reconciler: ActorRef<ReconcilerMessage>,
    /// Worker refs and ids by actor id, for restarts.
    workers: HashMap<ActorId, (String, ActorRef<WorkerMessage>)>,
    pipeline: Arc<JobPipeline>,
    idle_tx: mpsc::Sender<ActorRef<WorkerMessage>>,
    feeder: JoinHandle<()>,
    event_tx: broadcast::Sender<OrchestratorEvent>,
    flushing: Arc<AtomicBool>,
    stopping: bool,
}

impl SupervisorState {
    fn flusher(&self) -> Flusher {
        Flusher {
            drain_timeout: self.config.drain_timeout,
            poll: self.config.dispatch_poll,
            jobs: self.jobs.clone(),
            coordinator: self.coordinator.clone(),
            pipeline: self.pipeline.clone(),
        }
    }
}

async fn spawn_worker(
    myself: &ActorRef<SupervisorMessage>,
    state: &mut SupervisorState,
    worker_id: String,
) -> Result<(), ActorProcessingErr> {
    let args = WorkerArgs {
        worker_id: worker_id.clone(),
        coordinator: state.coordinator.clone(),
        pipeline: state.pipeline.clone(),
        idle_tx: state.idle_tx.clone(),
    };
    let (worker, _handle) = Actor::spawn_linked(None, WorkerActor, args, myself.get_cell())
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {}", e)))?;
    state.workers.insert(worker.get_id(), (worker_id, worker));
    Ok(())
}

/// Hand each idle worker the next delivery.
fn spawn_feeder(
    coordinator: ActorRef<CoordinatorMessage>,
    mut idle_rx: mpsc::Receiver<ActorRef<WorkerMessage>>,
    poll: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut deliveries = dispatch(coordinator.clone(), 1, poll);
        while let Some(worker) = idle_rx.recv().await {
            let Some(delivery) = deliveries.next().await else {
                break;
            };
            let delivery_id = delivery.delivery_id;
            let process = WorkerMessage::Process {
                delivery: Box::new(delivery),
            };
            if worker.send_message(process).is_err() {
                tracing::debug!(delivery_id = %delivery_id, "Worker gone; handing delivery back");
                let _ = coordinator.send_message(CoordinatorMessage::Nack { delivery_id });
            }
        }
        tracing::debug!("Feeder stopped");
    })
}

/// Reset procedure, run off the supervisor's mailbox.
struct Flusher {
    drain_timeout: Duration,
    poll: Duration,
    jobs: JobRepository,
    coordinator: ActorRef<CoordinatorMessage>,
    pipeline: Arc<JobPipeline>,
}

impl Flusher {
    async fn run(self) -> ActorResult<FlushReport> {
        tracing::warn!("Flushing orchestrator state");
        self.coordinator
            .send_message(CoordinatorMessage::Quiesce)
            .map_err(|e| ActorError::Actor(e.to_string()))?;
        self.pipeline.set_paused(true);

        let result = self.drain_and_purge().await;

        self.pipeline.set_paused(false);
        let _ = self.coordinator.send_message(CoordinatorMessage::Resume);
        if let Ok(report) = &result {
            tracing::info!(
                canceled = report.canceled,
                torn_down = report.torn_down,
                cleared_slots = report.cleared_slots,
                "Flush complete"
            );
        }
        result
    }

    async fn drain_and_purge(&self) -> ActorResult<FlushReport> {
        let lifecycle = self.pipeline.lifecycle();
        let mut report = FlushReport::default();

        let deadline = Instant::now() + self.drain_timeout;
        let mut signaled: Vec<JobId> = Vec::new();
        loop {
            let active = self.jobs.list_by_status(&JobStatus::ACTIVE).await?;
            if active.is_empty() {
                break;
            }
            for job in &active {
                if signaled.contains(&job.id) {
                    continue;
                }
                if matches!(
                    lifecycle.cancel(job.id).await?,
                    CancelOutcome::Canceled | CancelOutcome::Signaled
                ) {
                    signaled.push(job.id);
                }
            }
            if Instant::now() >= deadline {
                // Purging now would pull packages out from under live jobs
                tracing::warn!(remaining = active.len(), "Drain timed out; leaving state in place");
                return Err(ActorError::Actor(format!(
                    "drain timed out with {} job(s) still in flight",
                    active.len()
                )));
            }
            tokio::time::sleep(self.poll).await;
        }
        report.canceled = signaled.len();

        for handle in lifecycle.live_handles() {
            match lifecycle.teardown(&handle).await {
                Ok(()) => report.torn_down += 1,
                Err(e) => {
                    tracing::warn!(job_id = %handle.job_id, error = %e, "Teardown during flush failed")
                }
            }
        }
        match lifecycle.runtime().list_managed().await {
            Ok(containers) => {
                for container in containers {
                    if lifecycle.remove_container(&container.id).await {
                        report.torn_down += 1;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Cannot list containers during flush"),
        }

        self.pipeline.cache().purge_all().await?;
        report.cleared_slots = self.jobs.clear_all_containers().await?.len();
        Ok(report)
    }
}

/// Top-level actor of the orchestrator.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let config = args.config;
        tracing::info!(
            instance = %config.instance_id,
            workers = config.worker_concurrency,
            "Starting orchestrator supervisor"
        );

        let jobs = JobRepository::new(args.db.clone());

        let (coordinator, _) = Actor::spawn_linked(
            None,
            CoordinatorActor,
            CoordinatorArgs {
                config: config.clone(),
                jobs: jobs.clone(),
                lifecycle: args.lifecycle.clone(),
                event_tx: Some(args.events.clone()),
            },
            myself.get_cell(),
        )
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn coordinator: {}", e)))?;

        let pipeline = Arc::new(
            JobPipeline::new(
                args.db,
                args.cache.clone(),
                args.lifecycle.clone(),
                args.artifacts,
                args.mounts,
            )
            .with_events(args.events.clone()),
        );

        let reconciler = Reconciler::new(
            config.clone(),
            jobs.clone(),
            args.lifecycle,
            args.cache,
            pipeline.in_flight(),
        )
        .with_events(args.events.clone());
        let (reconciler, _) = Actor::spawn_linked(
            None,
            ReconcilerActor,
            ReconcilerArgs { reconciler },
            myself.get_cell(),
        )
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn reconciler: {}", e)))?;

        let (idle_tx, idle_rx) = mpsc::channel(config.worker_concurrency.max(1));
        let feeder = spawn_feeder(coordinator.clone(), idle_rx, config.dispatch_poll);

        let mut state = SupervisorState {
            config,
            jobs,
            coordinator,
            reconciler,
            workers: HashMap::new(),
            pipeline,
            idle_tx,
            feeder,
            event_tx: args.events,
            flushing: Arc::new(AtomicBool::new(false)),
            stopping: false,
        };

        for n in 1..=state.config.worker_concurrency {
            let worker_id = format!("{}/worker-{}", state.config.instance_id, n);
            spawn_worker(&myself, &mut state, worker_id).await?;
        }

        Ok(state)
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.feeder.abort();
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::Submit { submission, reply } => {
                state
                    .coordinator
                    .send_message(CoordinatorMessage::Enqueue { submission, reply })?;
            }

            SupervisorMessage::Cancel { job_id, reply } => {
                state
                    .coordinator
                    .send_message(CoordinatorMessage::Cancel { job_id, reply })?;
            }

            SupervisorMessage::GetJob { job_id, reply } => {
                let result = state
                    .jobs
                    .find(job_id)
                    .await
                    .map_err(|e| format!("Failed to load job: {}", e));
                let _ = reply.send(result);
            }

            SupervisorMessage::Flush { reply } => {
                if state.flushing.swap(true, Ordering::SeqCst) {
                    let _ = reply.send(Err("A flush is already running".into()));
                    return Ok(());
                }
                let flusher = state.flusher();
                let flushing = state.flushing.clone();
                tokio::spawn(async move {
                    let result = flusher.run().await.map_err(|e| e.to_string());
                    flushing.store(false, Ordering::SeqCst);
                    let _ = reply.send(result);
                });
            }

            SupervisorMessage::Reconcile { reply } => {
                state.reconciler.send_message(ReconcilerMessage::Sweep {
                    reply: Some(reply),
                })?;
            }

            SupervisorMessage::CollectGarbage { reply } => {
                state
                    .reconciler
                    .send_message(ReconcilerMessage::CollectGarbage { reply: Some(reply) })?;
            }

            SupervisorMessage::Subscribe { reply } => {
                let _ = reply.send(state.event_tx.subscribe());
            }

            SupervisorMessage::GetStats { reply } => {
                state
                    .coordinator
                    .send_message(CoordinatorMessage::GetStats { reply })?;
            }

            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down supervisor");
                state.stopping = true;
                state.feeder.abort();
                for (_, worker) in state.workers.values() {
                    let _ = worker.send_message(WorkerMessage::Shutdown);
                }
                state.reconciler.stop(None);
                state.coordinator.stop(None);
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorFailed(cell, error) => {
                let Some((worker_id, _)) = state.workers.remove(&cell.get_id()) else {
                    tracing::error!(actor = %cell.get_id(), error = %error, "Child actor failed");
                    if cell.get_id() == state.coordinator.get_id() {
                        myself.stop(Some("coordinator failed".into()));
                    }
                    return Ok(());
                };
                tracing::error!(worker = %worker_id, error = %error, "Worker failed");
                if !state.stopping {
                    tracing::info!(worker = %worker_id, "Restarting worker");
                    spawn_worker(&myself, state, worker_id).await?;
                }
            }
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                state.workers.remove(&cell.get_id());
                tracing::debug!(actor = %cell.get_id(), reason = ?reason, "Child actor stopped");
            }
            _ => {}
        }
        Ok(())
    }
}

/// Typed client for a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    actor: ActorRef<SupervisorMessage>,
}

impl SupervisorHandle {
    pub fn new(actor: ActorRef<SupervisorMessage>) -> Self {
        Self { actor }
    }

    pub fn actor(&self) -> &ActorRef<SupervisorMessage> {
        &self.actor
    }

    async fn call<T, F>(&self, build: F, timeout: Option<Duration>) -> ActorResult<T>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<T>) -> SupervisorMessage,
    {
        match ractor::rpc::call(&self.actor, build, timeout).await {
            Ok(CallResult::Success(value)) => Ok(value),
            Ok(CallResult::Timeout) => Err(ActorError::Timeout),
            Ok(CallResult::SenderError) => Err(ActorError::Actor("reply dropped".into())),
            Err(e) => Err(ActorError::Actor(e.to_string())),
        }
    }

    /// Submit a job. Resubmitting an idempotency key returns the existing id.
    pub async fn submit(&self, submission: JobSubmission) -> ActorResult<JobId> {
        self.call(
            |reply| SupervisorMessage::Submit {
                submission: Box::new(submission),
                reply,
            },
            Some(CALL_TIMEOUT),
        )
        .await?
        .map_err(ActorError::Rejected)
    }

    pub async fn cancel(&self, job_id: JobId) -> ActorResult<CancelOutcome> {
        self.call(
            |reply| SupervisorMessage::Cancel { job_id, reply },
            Some(CALL_TIMEOUT),
        )
        .await?
        .map_err(ActorError::Actor)
    }

    pub async fn get(&self, job_id: JobId) -> ActorResult<Option<Job>> {
        self.call(
            |reply| SupervisorMessage::GetJob { job_id, reply },
            Some(CALL_TIMEOUT),
        )
        .await?
        .map_err(ActorError::Actor)
    }

    /// Wait until the job reaches a terminal state or `timeout` passes.
    pub async fn wait_terminal(&self, job_id: JobId, timeout: Duration) -> ActorResult<Job> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.get(job_id).await? {
                Some(job) if job.status.is_terminal() => return Ok(job),
                Some(_) => {}
                None => return Err(ActorError::JobNotFound(job_id)),
            }
            if Instant::now() >= deadline {
                return Err(ActorError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Quiesce, drain, tear down and purge. Waits as long as the drain takes.
    pub async fn flush(&self) -> ActorResult<FlushReport> {
        self.call(|reply| SupervisorMessage::Flush { reply }, None)
            .await?
            .map_err(ActorError::Actor)
    }

    pub async fn reconcile(&self) -> ActorResult<ReconcileReport> {
        self.call(|reply| SupervisorMessage::Reconcile { reply }, None)
            .await?
            .map_err(ActorError::Actor)
    }

    /// Run garbage collection now. Returns how many entries were evicted.
    pub async fn collect_garbage(&self) -> ActorResult<usize> {
        self.call(|reply| SupervisorMessage::CollectGarbage { reply }, None)
            .await?
            .map_err(ActorError::Actor)
    }

    pub async fn subscribe(&self) -> ActorResult<broadcast::Receiver<OrchestratorEvent>> {
        self.call(|reply| SupervisorMessage::Subscribe { reply }, Some(CALL_TIMEOUT))
            .await
    }

    pub async fn stats(&self) -> ActorResult<CoordinatorStats> {
        self.call(|reply| SupervisorMessage::GetStats { reply }, Some(CALL_TIMEOUT))
            .await
    }

    pub fn shutdown(&self) {
        let _ = self.actor.send_message(SupervisorMessage::Shutdown);
    }
}

/// Start the supervisor and everything under it.
pub async fn start_supervisor(
    args: SupervisorArgs,
) -> Result<(SupervisorHandle, JoinHandle<()>), ractor::SpawnErr> {
    let (actor, handle) = Actor::spawn(None, Supervisor, args).await?;
    Ok((SupervisorHandle::new(actor), handle))
}
