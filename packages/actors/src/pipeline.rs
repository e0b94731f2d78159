//! The steps a worker runs for one job.
//!
//! claim, resolve packages, prepare artifacts, provision, run, collect,
//! tear down, finalize, release. Steps run strictly in order and every
//! failure still releases the package reference and tears the container
//! down.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use cache::{CacheError, PackageCache};
use chrono::Utc;
use dashmap::DashSet;
use db::repositories::{ArtifactRepository, JobRepository};
use db::Database;
use orchestrator_core::{
    ContainerHandle, Delivery, FailureReason, Job, JobId, JobStatus, OrchestratorEvent,
};
use ractor::ActorRef;
use runtime::{Completion, LifecycleError, LifecycleManager, MountPlan};
use storage::ArtifactStore;
use tokio::sync::broadcast;

use crate::messages::CoordinatorMessage;

/// Name under which the container's output is stored.
pub const LOG_ARTIFACT: &str = "container.log";

/// What happened to a delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Another consumer already claimed the job.
    Duplicate,
    /// Not processed; handed back to the coordinator.
    Deferred,
    /// Processed to the given terminal (or retry-bound) state.
    Finished(Option<Job>),
}

/// How far a run got before the job is finalized.
enum RunStep {
    Completed(Completion),
    CanceledBeforeStart,
    Failed(FailureReason),
    /// The lifecycle manager already wrote the outcome.
    Recorded,
}

/// Shared services every worker uses.
pub struct JobPipeline {
    jobs: JobRepository,
    artifacts: ArtifactRepository,
    cache: Arc<PackageCache>,
    lifecycle: Arc<LifecycleManager>,
    store: ArtifactStore,
    mounts: MountPlan,
    /// Jobs this process is working on; the reconciler leaves them alone.
    in_flight: Arc<DashSet<JobId>>,
    paused: AtomicBool,
    event_tx: Option<broadcast::Sender<OrchestratorEvent>>,
}

impl JobPipeline {
    pub fn new(
        db: Database,
        cache: Arc<PackageCache>,
        lifecycle: Arc<LifecycleManager>,
        store: ArtifactStore,
        mounts: MountPlan,
    ) -> Self {
        Self {
            jobs: JobRepository::new(db.clone()),
            artifacts: ArtifactRepository::new(db),
            cache,
            lifecycle,
            store,
            mounts,
            in_flight: Arc::new(DashSet::new()),
            paused: AtomicBool::new(false),
            event_tx: None,
        }
    }

    pub fn with_events(mut self, tx: broadcast::Sender<OrchestratorEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn in_flight(&self) -> Arc<DashSet<JobId>> {
        self.in_flight.clone()
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn cache(&self) -> &Arc<PackageCache> {
        &self.cache
    }

    /// While paused, deliveries are handed back without being claimed.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    fn broadcast(&self, event: OrchestratorEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Process one delivery on behalf of `worker_id`.
    pub async fn run(
        &self,
        worker_id: &str,
        delivery: Delivery,
        coordinator: &ActorRef<CoordinatorMessage>,
    ) -> PipelineOutcome {
        let job_id = delivery.job_id();
        let delivery_id = delivery.delivery_id;

        if self.paused.load(Ordering::SeqCst) {
            let _ = coordinator.send_message(CoordinatorMessage::Nack { delivery_id });
            return PipelineOutcome::Deferred;
        }

        let claimed = match self.jobs.claim(job_id, worker_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::debug!(job_id = %job_id, "Job already claimed; dropping duplicate delivery");
                let _ = coordinator.send_message(CoordinatorMessage::Ack { delivery_id });
                return PipelineOutcome::Duplicate;
            }
            Err(e) => {
                // Leave it unacknowledged so it comes back
                tracing::warn!(job_id = %job_id, error = %e, "Failed to claim job");
                return PipelineOutcome::Deferred;
            }
        };
        let _ = coordinator.send_message(CoordinatorMessage::Ack { delivery_id });

        let _in_flight = InFlightGuard::new(self.in_flight.clone(), job_id);
        tracing::info!(
            job_id = %job_id,
            worker = %worker_id,
            attempt = claimed.attempt_count,
            "Claimed job"
        );
        self.broadcast(OrchestratorEvent::JobClaimed {
            job_id,
            worker_id: worker_id.to_string(),
            attempt: claimed.attempt_count,
            timestamp: Utc::now(),
        });

        let finished = match self.execute(&claimed).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Job pipeline failed");
                self.fail(&claimed, FailureReason::TransientInfra {
                    message: e.to_string(),
                })
                .await
            }
        };

        if let Some(job) = &finished
            && job.failure.as_ref().is_some_and(FailureReason::is_retryable)
            && job.has_attempts_left()
        {
            let _ = coordinator.send_message(CoordinatorMessage::Retry { job_id });
        }
        PipelineOutcome::Finished(finished)
    }

    async fn execute(&self, job: &Job) -> Result<Option<Job>, LifecycleError> {
        let job_id = job.id;

        if self.lifecycle.cancel_requested(job_id).await? {
            return self.lifecycle.finalize(job, Completion::Canceled).await;
        }

        let package_dir = match self.cache.ensure(&job.dependency_spec, job_id).await {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(job_id = %job_id, hash = %job.dependency_hash, error = %e, "Dependency resolution failed");
                let failed = self.fail(job, cache_failure(&e)).await;
                self.release(job).await;
                return Ok(failed);
            }
        };

        let finished = match self.run_and_finalize(job, package_dir).await {
            Ok(finished) => finished,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Job pipeline failed");
                self.fail(job, FailureReason::TransientInfra {
                    message: e.to_string(),
                })
                .await
            }
        };
        // The reference goes back once the job is terminal
        self.release(job).await;
        Ok(finished)
    }

    async fn run_and_finalize(
        &self,
        job: &Job,
        package_dir: PathBuf,
    ) -> Result<Option<Job>, LifecycleError> {
        match self.run_container(job, package_dir).await? {
            RunStep::Completed(completion) => {
                let mut running = job.clone();
                running.status = JobStatus::Running;
                self.lifecycle.finalize(&running, completion).await
            }
            RunStep::CanceledBeforeStart => self.lifecycle.finalize(job, Completion::Canceled).await,
            RunStep::Failed(reason) => Ok(self.fail(job, reason).await),
            RunStep::Recorded => Ok(self.jobs.find(job.id).await?),
        }
    }

    async fn run_container(
        &self,
        job: &Job,
        package_dir: PathBuf,
    ) -> Result<RunStep, LifecycleError> {
        let job_id = job.id;

        let artifact_dir = match self.store.prepare(job_id).await {
            Ok(dir) => dir,
            Err(e) => {
                return Ok(RunStep::Failed(FailureReason::TransientInfra {
                    message: e.to_string(),
                }));
            }
        };
        let mounts = match self.mounts.mounts(&package_dir, &artifact_dir) {
            Ok(mounts) => mounts,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Refusing unsafe mount");
                return Ok(RunStep::Failed(FailureReason::RuntimeError {
                    message: e.to_string(),
                }));
            }
        };

        let handle = match self.lifecycle.provision(job, mounts).await {
            Ok(handle) => handle,
            Err(LifecycleError::Canceled(_)) => return Ok(RunStep::CanceledBeforeStart),
            // The failure is already on the job
            Err(e) if e.failure().is_some() => return Ok(RunStep::Recorded),
            Err(LifecycleError::Superseded(_)) => return Ok(RunStep::Recorded),
            Err(e) => return Err(e),
        };

        let completion = match self.lifecycle.await_completion(&handle).await {
            Ok(completion) => completion,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Lost track of container");
                self.teardown(&handle).await;
                return Ok(RunStep::Failed(FailureReason::RuntimeError {
                    message: e.to_string(),
                }));
            }
        };

        if !matches!(completion, Completion::Canceled | Completion::Lost) {
            self.collect(&handle).await;
        }
        self.teardown(&handle).await;
        Ok(RunStep::Completed(completion))
    }

    /// Store the container log and record every artifact file.
    async fn collect(&self, handle: &ContainerHandle) {
        let job_id = handle.job_id;
        match self.lifecycle.logs(handle).await {
            Ok(logs) => {
                if let Err(e) = self.store.put(job_id, LOG_ARTIFACT, Bytes::from(logs)).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to store container log");
                }
            }
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to read container log"),
        }

        let records = match self.store.collect(job_id).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to scan artifacts");
                return;
            }
        };
        for record in &records {
            if let Err(e) = self.artifacts.record(record).await {
                tracing::warn!(job_id = %job_id, path = %record.path, error = %e, "Failed to record artifact");
            }
        }
        tracing::debug!(job_id = %job_id, count = records.len(), "Recorded artifacts");
    }

    async fn teardown(&self, handle: &ContainerHandle) {
        if let Err(e) = self.lifecycle.teardown(handle).await {
            // The reconciler removes whatever is left
            tracing::warn!(job_id = %handle.job_id, error = %e, "Teardown failed");
        }
    }

    async fn release(&self, job: &Job) {
        if let Err(e) = self.cache.release(&job.dependency_hash, job.id).await {
            tracing::warn!(job_id = %job.id, hash = %job.dependency_hash, error = %e, "Failed to release package reference");
        }
    }

    async fn fail(&self, job: &Job, reason: FailureReason) -> Option<Job> {
        match self.lifecycle.fail(job, reason).await {
            Ok(Some(job)) => Some(job),
            Ok(None) => self.jobs.find(job.id).await.ok().flatten(),
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to record job failure");
                None
            }
        }
    }
}

/// Keeps a job in the in-flight set until dropped, including on unwind.
struct InFlightGuard {
    set: Arc<DashSet<JobId>>,
    job_id: JobId,
}

impl InFlightGuard {
    fn new(set: Arc<DashSet<JobId>>, job_id: JobId) -> Self {
        set.insert(job_id);
        Self { set, job_id }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.remove(&self.job_id);
    }
}

/// Install failures are about the dependency set; everything else is
/// infrastructure.
fn cache_failure(e: &CacheError) -> FailureReason {
    match e {
        CacheError::Install { message, .. } => FailureReason::DependencyInstall {
            message: message.clone(),
        },
        other => FailureReason::TransientInfra {
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::DependencyHash;

    #[test]
    fn install_errors_map_to_dependency_install() {
        let install = CacheError::Install {
            hash: DependencyHash::from("abc"),
            message: "no matching distribution".into(),
        };
        assert_eq!(cache_failure(&install).code(), "dependency_install");

        let timeout = CacheError::LeaseTimeout(DependencyHash::from("abc"));
        let reason = cache_failure(&timeout);
        assert_eq!(reason.code(), "transient_infra");
        assert!(reason.is_retryable());
    }
}
