//! Reconciler: repairs drift between the job table, the container runtime
//! and the package cache.
//!
//! A sweep only ever moves things towards a consistent state, so running it
//! twice in a row makes no further changes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cache::{CacheRepairReport, PackageCache};
use chrono::Utc;
use dashmap::DashSet;
use db::repositories::JobRepository;
use orchestrator_core::{
    DependencyHash, FailureReason, Job, JobId, JobStatus, OrchestratorEvent,
};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use runtime::{LifecycleManager, RuntimeContainer};
use tokio::sync::broadcast;

use crate::config::OrchestratorConfig;
use crate::messages::{ActorResult, ReconcilerMessage};

/// Repairs made by one sweep.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileReport {
    /// Running jobs whose container had disappeared.
    pub lost_jobs: Vec<JobId>,
    /// Provisioning jobs that never got a container.
    pub stale_provisioning: Vec<JobId>,
    /// Managed containers with no live job behind them.
    pub removed_containers: Vec<String>,
    /// The runtime could not be listed; container checks were skipped.
    pub runtime_skipped: bool,
    pub cache: CacheRepairReport,
    pub index_rebuilt: bool,
}

impl ReconcileReport {
    pub fn repairs(&self) -> usize {
        self.lost_jobs.len()
            + self.stale_provisioning.len()
            + self.removed_containers.len()
            + self.cache.repairs()
            + usize::from(self.index_rebuilt)
    }

    pub fn is_empty(&self) -> bool {
        self.repairs() == 0 && !self.cache.index_corrupt
    }
}

/// The sweep logic, usable without an actor.
pub struct Reconciler {
    config: OrchestratorConfig,
    jobs: JobRepository,
    lifecycle: Arc<LifecycleManager>,
    cache: Arc<PackageCache>,
    in_flight: Arc<DashSet<JobId>>,
    event_tx: Option<broadcast::Sender<OrchestratorEvent>>,
}

impl Reconciler {
    pub fn new(
        config: OrchestratorConfig,
        jobs: JobRepository,
        lifecycle: Arc<LifecycleManager>,
        cache: Arc<PackageCache>,
        in_flight: Arc<DashSet<JobId>>,
    ) -> Self {
        Self {
            config,
            jobs,
            lifecycle,
            cache,
            in_flight,
            event_tx: None,
        }
    }

    pub fn with_events(mut self, tx: broadcast::Sender<OrchestratorEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Run one full sweep.
    pub async fn sweep(&self) -> ActorResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        // Exited containers still count: their owner may not have collected them yet
        let live = match self.lifecycle.runtime().list_managed().await {
            Ok(live) => Some(live),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot list containers; skipping container checks");
                report.runtime_skipped = true;
                None
            }
        };

        if let Some(live) = &live {
            self.check_jobs(live, &mut report).await?;
            self.remove_orphans(live, &mut report).await?;
        }

        report.cache = self.cache.reconcile().await?;
        if !self.cache.is_healthy() {
            let holders = self.active_holders().await?;
            self.cache.rebuild_index(&holders).await?;
            report.index_rebuilt = true;
        }

        if report.is_empty() {
            tracing::debug!("Reconcile sweep found nothing to repair");
        } else {
            tracing::info!(
                lost = report.lost_jobs.len(),
                stale = report.stale_provisioning.len(),
                orphans = report.removed_containers.len(),
                cache_repairs = report.cache.repairs(),
                index_rebuilt = report.index_rebuilt,
                "Reconcile sweep repaired drift"
            );
            if let Some(ref tx) = self.event_tx {
                let _ = tx.send(OrchestratorEvent::ReconcileCompleted {
                    repairs: report.repairs(),
                    timestamp: Utc::now(),
                });
            }
        }
        Ok(report)
    }

    /// Evict unreferenced packages past retention.
    pub async fn collect_garbage(&self) -> ActorResult<usize> {
        Ok(self.cache.collect_garbage().await?.len())
    }

    async fn check_jobs(
        &self,
        live: &[RuntimeContainer],
        report: &mut ReconcileReport,
    ) -> ActorResult<()> {
        let live_jobs: HashSet<JobId> = live.iter().filter_map(RuntimeContainer::job_id).collect();
        let stale_after = chrono::Duration::from_std(self.config.stale_provisioning)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let now = Utc::now();

        for job in self.jobs.list_by_status(&JobStatus::ACTIVE).await? {
            // Workers in this process handle their own jobs
            if self.in_flight.contains(&job.id) {
                continue;
            }

            match job.status {
                JobStatus::Running => {
                    let present = job.container.as_ref().is_some_and(|handle| {
                        live.iter()
                            .any(|c| c.id == handle.runtime_id || c.name == handle.name)
                    });
                    if present {
                        continue;
                    }
                    tracing::warn!(job_id = %job.id, "Container for running job is gone");
                    if self.abandon(&job, FailureReason::ContainerLost).await? {
                        report.lost_jobs.push(job.id);
                    }
                }
                JobStatus::Provisioning => {
                    if job.container.is_some()
                        || live_jobs.contains(&job.id)
                        || now - job.updated_at < stale_after
                    {
                        continue;
                    }
                    tracing::warn!(job_id = %job.id, "Provisioning job was abandoned");
                    if self.abandon(&job, FailureReason::ProvisionTimeout).await? {
                        report.stale_provisioning.push(job.id);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Fail the job and give back what it held. Returns whether the job was
    /// still in the state we saw.
    async fn abandon(&self, job: &Job, reason: FailureReason) -> ActorResult<bool> {
        let Some(_) = self.lifecycle.fail(job, reason).await? else {
            return Ok(false);
        };
        self.lifecycle.forget(job.id);
        self.jobs.clear_container(job.id).await?;
        if let Err(e) = self.cache.release(&job.dependency_hash, job.id).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to release package reference");
        }
        Ok(true)
    }

    async fn remove_orphans(
        &self,
        live: &[RuntimeContainer],
        report: &mut ReconcileReport,
    ) -> ActorResult<()> {
        for container in live {
            let owned = match container.job_id() {
                Some(job_id) => self
                    .jobs
                    .find(job_id)
                    .await?
                    .is_some_and(|job| job.status.is_active()),
                None => false,
            };
            if owned {
                continue;
            }
            tracing::info!(container = %container.name, "Removing orphaned container");
            if self.lifecycle.remove_container(&container.id).await {
                report.removed_containers.push(container.name.clone());
            }
        }
        Ok(())
    }

    /// Which jobs still hold each dependency set.
    async fn active_holders(&self) -> ActorResult<HashMap<DependencyHash, Vec<JobId>>> {
        let mut holders: HashMap<DependencyHash, Vec<JobId>> = HashMap::new();
        for job in self.jobs.list_by_status(&JobStatus::ACTIVE).await? {
            holders.entry(job.dependency_hash).or_default().push(job.id);
        }
        Ok(holders)
    }
}

/// Reconciler actor arguments.
pub struct ReconcilerArgs {
    pub reconciler: Reconciler,
}

/// Runs sweeps and garbage collection on their intervals and on demand.
pub struct ReconcilerActor;

impl Actor for ReconcilerActor {
    type Msg = ReconcilerMessage;
    type State = Reconciler;
    type Arguments = ReconcilerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting reconciler");
        let reconciler = args.reconciler;

        let sweep_every = reconciler.config.reconcile_interval;
        let sweeper = myself.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_every);
            loop {
                interval.tick().await;
                if sweeper
                    .send_message(ReconcilerMessage::Sweep { reply: None })
                    .is_err()
                {
                    break;
                }
            }
        });

        let gc_every = reconciler.config.gc_interval;
        let collector = myself.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(gc_every);
            // The first tick fires immediately; skip it
            interval.tick().await;
            loop {
                interval.tick().await;
                if collector
                    .send_message(ReconcilerMessage::CollectGarbage { reply: None })
                    .is_err()
                {
                    break;
                }
            }
        });

        Ok(reconciler)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ReconcilerMessage::Sweep { reply } => {
                let result = state.sweep().await.map_err(|e| e.to_string());
                if let Err(e) = &result {
                    tracing::error!(error = %e, "Reconcile sweep failed");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }

            ReconcilerMessage::CollectGarbage { reply } => {
                let result = state.collect_garbage().await.map_err(|e| e.to_string());
                if let Err(e) = &result {
                    tracing::error!(error = %e, "Garbage collection failed");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }

        Ok(())
    }
}
