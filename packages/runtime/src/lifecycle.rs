//! Per-job container lifecycle.
//!
//! The manager owns the `provisioning -> running -> terminal` edges of a
//! job's state machine. Every transition is a conditional write against
//! the job row, so a job that another party already finished is never
//! overwritten.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use db::repositories::JobRepository;
use db::{Database, DbError};
use orchestrator_core::{
    ContainerHandle, FailureReason, JOB_ID_LABEL, Job, JobId, JobStatus, MANAGED_LABEL, Mount,
    OrchestratorEvent, PAYLOAD_LABEL, ResourceLimits, container_name,
};
use tokio::sync::broadcast;

use crate::client::{ContainerRuntime, ContainerSpec, RuntimeError};
use crate::mounts::{ARTIFACT_MOUNT, PACKAGE_MOUNT};

const RUNNING: &[JobStatus] = &[JobStatus::Running];
const CANCELABLE: &[JobStatus] = &[JobStatus::Queued, JobStatus::Provisioning, JobStatus::Running];
const ACTIVE: &[JobStatus] = &JobStatus::ACTIVE;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("invalid lifecycle config: {0}")]
    InvalidConfig(String),

    #[error("job {0} has no usable resource limits")]
    MissingLimits(JobId),

    #[error("job {job_id} failed to provision: {reason}")]
    Provision {
        job_id: JobId,
        reason: FailureReason,
    },

    #[error("job {0} was canceled")]
    Canceled(JobId),

    #[error("job {0} left the provisioning state")]
    Superseded(JobId),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

impl LifecycleError {
    /// The reason code already recorded on the job, if any.
    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            LifecycleError::MissingLimits(_) => Some(FailureReason::MissingLimits),
            LifecycleError::Provision { reason, .. } => Some(reason.clone()),
            _ => None,
        }
    }
}

/// How a container run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Exited(i64),
    TimedOut,
    Canceled,
    /// The container disappeared before reporting an exit.
    Lost,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was queued and is now canceled.
    Canceled,
    /// The job is in flight; its worker will stop the container.
    Signaled,
    /// The job had already finished.
    AlreadyTerminal(JobStatus),
    NotFound,
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Image every sibling container runs.
    pub image: String,
    /// Bound on create + start.
    pub provision_timeout: Duration,
    /// How often a running job checks its cancel flag.
    pub poll_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            image: "sibling-agent:latest".to_string(),
            provision_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl LifecycleConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_provision_timeout(mut self, timeout: Duration) -> Self {
        self.provision_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Build a config from environment variables.
    ///
    /// - `AGENT_IMAGE` (default: `sibling-agent:latest`)
    /// - `PROVISION_TIMEOUT_SECS` (default: 60)
    pub fn from_env() -> Result<Self, LifecycleError> {
        let mut config = Self::default();
        if let Ok(image) = std::env::var("AGENT_IMAGE")
            && !image.trim().is_empty()
        {
            config.image = image.trim().to_string();
        }
        if let Ok(raw) = std::env::var("PROVISION_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                LifecycleError::InvalidConfig(format!("PROVISION_TIMEOUT_SECS={raw:?}"))
            })?;
            if secs == 0 {
                return Err(LifecycleError::InvalidConfig(
                    "PROVISION_TIMEOUT_SECS must be positive".into(),
                ));
            }
            config.provision_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

/// Provisions, watches, cancels and tears down sibling containers.
pub struct LifecycleManager {
    config: LifecycleConfig,
    runtime: Arc<dyn ContainerRuntime>,
    jobs: JobRepository,
    handles: DashMap<JobId, ContainerHandle>,
    cancels: DashMap<JobId, Arc<AtomicBool>>,
    events: Option<broadcast::Sender<OrchestratorEvent>>,
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig, runtime: Arc<dyn ContainerRuntime>, db: Database) -> Self {
        Self {
            config,
            runtime,
            jobs: JobRepository::new(db),
            handles: DashMap::new(),
            cancels: DashMap::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, tx: broadcast::Sender<OrchestratorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Live handle owned by `job_id` in this process.
    pub fn handle(&self, job_id: JobId) -> Option<ContainerHandle> {
        self.handles.get(&job_id).map(|h| h.clone())
    }

    pub fn live_handles(&self) -> Vec<ContainerHandle> {
        self.handles.iter().map(|h| h.value().clone()).collect()
    }

    /// Whether a cancel was requested through this manager.
    pub fn is_cancel_requested(&self, job_id: JobId) -> bool {
        self.cancels
            .get(&job_id)
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Whether a cancel was requested here or by any other process sharing
    /// the job table.
    pub async fn cancel_requested(&self, job_id: JobId) -> Result<bool, LifecycleError> {
        if self.is_cancel_requested(job_id) {
            return Ok(true);
        }
        let requested = self
            .jobs
            .find(job_id)
            .await?
            .is_some_and(|job| job.cancel_requested);
        if requested {
            self.cancel_flag(job_id).store(true, Ordering::SeqCst);
        }
        Ok(requested)
    }

    fn cancel_flag(&self, job_id: JobId) -> Arc<AtomicBool> {
        self.cancels.entry(job_id).or_default().clone()
    }

    fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn status_changed(&self, job_id: JobId, old: JobStatus, job: &Job) {
        self.emit(OrchestratorEvent::JobStatusChanged {
            job_id,
            old_status: old,
            new_status: job.status,
            failure: job.failure.clone(),
            timestamp: Utc::now(),
        });
    }

    fn container_spec(&self, job: &Job, mounts: Vec<Mount>, limits: ResourceLimits) -> ContainerSpec {
        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (JOB_ID_LABEL.to_string(), job.id.to_string()),
            (PAYLOAD_LABEL.to_string(), job.payload_reference.clone()),
        ]);
        let env = vec![
            ("JOB_ID".to_string(), job.id.to_string()),
            ("PAYLOAD_REFERENCE".to_string(), job.payload_reference.clone()),
            ("PACKAGE_PATH".to_string(), PACKAGE_MOUNT.to_string()),
            ("ARTIFACT_DIR".to_string(), ARTIFACT_MOUNT.to_string()),
            ("PYTHONPATH".to_string(), PACKAGE_MOUNT.to_string()),
        ];
        ContainerSpec {
            name: container_name(job.id),
            image: self.config.image.clone(),
            env,
            labels,
            mounts,
            limits,
        }
    }

    /// Create and start the job's container and move it to `running`.
    ///
    /// Returns the existing handle when the job already owns a live one.
    pub async fn provision(
        &self,
        job: &Job,
        mounts: Vec<Mount>,
    ) -> Result<ContainerHandle, LifecycleError> {
        let job_id = job.id;

        let Some(limits) = job.resource_limits.filter(ResourceLimits::is_valid) else {
            tracing::warn!(job_id = %job_id, "Rejecting job without resource limits");
            self.fail(job, FailureReason::MissingLimits).await?;
            return Err(LifecycleError::MissingLimits(job_id));
        };

        if let Some(handle) = self.handle(job_id) {
            return Ok(handle);
        }
        if job.status == JobStatus::Running
            && let Some(handle) = &job.container
        {
            self.handles.insert(job_id, handle.clone());
            return Ok(handle.clone());
        }

        if self.cancel_requested(job_id).await? {
            return Err(LifecycleError::Canceled(job_id));
        }

        let spec = self.container_spec(job, mounts, limits);
        let created =
            tokio::time::timeout(self.config.provision_timeout, self.runtime.create(&spec)).await;

        let container = match created {
            Ok(Ok(container)) => container,
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job_id, error = %e, "Container create failed");
                let reason = if e.is_transient() {
                    FailureReason::TransientInfra {
                        message: e.to_string(),
                    }
                } else {
                    FailureReason::RuntimeError {
                        message: e.to_string(),
                    }
                };
                self.remove_container(&spec.name).await;
                self.fail(job, reason.clone()).await?;
                return Err(LifecycleError::Provision { job_id, reason });
            }
            Err(_) => {
                tracing::warn!(
                    job_id = %job_id,
                    timeout_secs = self.config.provision_timeout.as_secs(),
                    "Container did not start in time"
                );
                self.remove_container(&spec.name).await;
                self.fail(job, FailureReason::ProvisionTimeout).await?;
                return Err(LifecycleError::Provision {
                    job_id,
                    reason: FailureReason::ProvisionTimeout,
                });
            }
        };

        let handle = ContainerHandle {
            job_id,
            runtime_id: container.id.clone(),
            name: container.name.clone(),
            mounts: spec.mounts,
            resource_limits: limits,
            started_at: Utc::now(),
        };

        let marked = match self.jobs.mark_running(job_id, &handle).await {
            Ok(marked) => marked,
            Err(e) => {
                // The name is deterministic; a leftover would block the retry
                tracing::warn!(job_id = %job_id, error = %e, "Cannot record running container");
                self.remove_container(&handle.runtime_id).await;
                return Err(e.into());
            }
        };
        match marked {
            Some(updated) => {
                self.handles.insert(job_id, handle.clone());
                self.emit(OrchestratorEvent::ContainerStarted {
                    job_id,
                    runtime_id: handle.runtime_id.clone(),
                    timestamp: Utc::now(),
                });
                self.status_changed(job_id, JobStatus::Provisioning, &updated);
                tracing::info!(job_id = %job_id, container = %handle.name, "Job running");
                Ok(handle)
            }
            None => {
                tracing::warn!(job_id = %job_id, "Job changed state during provisioning");
                self.remove_container(&handle.runtime_id).await;
                Err(LifecycleError::Superseded(job_id))
            }
        }
    }

    /// Wait for the container to exit, enforcing the job's timeout and
    /// observing cancel requests.
    pub async fn await_completion(
        &self,
        handle: &ContainerHandle,
    ) -> Result<Completion, LifecycleError> {
        let job_id = handle.job_id;
        let elapsed = (Utc::now() - handle.started_at).to_std().unwrap_or_default();
        let remaining = handle.resource_limits.timeout().saturating_sub(elapsed);

        let wait = self.runtime.wait(&handle.runtime_id);
        tokio::pin!(wait);
        let deadline = tokio::time::sleep(remaining);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                result = &mut wait => {
                    return match result {
                        Ok(code) => Ok(Completion::Exited(code)),
                        Err(e) if e.is_not_found() => {
                            tracing::warn!(job_id = %job_id, "Container vanished while running");
                            Ok(Completion::Lost)
                        }
                        Err(e) => Err(e.into()),
                    };
                }
                _ = &mut deadline => {
                    tracing::warn!(job_id = %job_id, "Job exceeded its timeout");
                    self.stop(handle).await;
                    return Ok(Completion::TimedOut);
                }
                _ = ticker.tick() => {
                    match self.cancel_requested(job_id).await {
                        Ok(true) => {
                            tracing::info!(job_id = %job_id, "Stopping canceled job");
                            self.stop(handle).await;
                            return Ok(Completion::Canceled);
                        }
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!(job_id = %job_id, error = %e, "Cannot check for a cancel request")
                        }
                    }
                }
            }
        }
    }

    async fn stop(&self, handle: &ContainerHandle) {
        match self.runtime.stop(&handle.runtime_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(job_id = %handle.job_id, error = %e, "Failed to stop container")
            }
        }
    }

    /// Cancel a job. Queued jobs are canceled outright; in-flight jobs are
    /// flagged on their row so the owning worker stops them, wherever it runs.
    pub async fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, LifecycleError> {
        let Some(job) = self.jobs.find(job_id).await? else {
            return Ok(CancelOutcome::NotFound);
        };

        if job.status == JobStatus::Queued {
            if let Some(updated) = self
                .jobs
                .finish(job_id, &[JobStatus::Queued], JobStatus::Canceled, None, None)
                .await?
            {
                tracing::info!(job_id = %job_id, "Canceled queued job");
                self.status_changed(job_id, JobStatus::Queued, &updated);
                return Ok(CancelOutcome::Canceled);
            }
            // Claimed in the meantime; fall through to signal the worker.
        } else if job.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(job.status));
        }

        self.cancel_flag(job_id).store(true, Ordering::SeqCst);
        if self.jobs.request_cancel(job_id).await?.is_none()
            && let Some(current) = self.jobs.find(job_id).await?
            && current.status.is_terminal()
        {
            self.cancels.remove(&job_id);
            return Ok(CancelOutcome::AlreadyTerminal(current.status));
        }
        tracing::info!(job_id = %job_id, "Cancel requested");
        Ok(CancelOutcome::Signaled)
    }

    /// Stop and remove the container and empty the job's slot.
    ///
    /// A container the runtime no longer knows counts as removed.
    pub async fn teardown(&self, handle: &ContainerHandle) -> Result<(), LifecycleError> {
        self.stop(handle).await;
        match self.runtime.remove(&handle.runtime_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!(job_id = %handle.job_id, "Container already gone");
            }
            Err(e) => return Err(e.into()),
        }
        self.handles.remove(&handle.job_id);
        self.jobs.clear_container(handle.job_id).await?;
        self.emit(OrchestratorEvent::ContainerRemoved {
            job_id: handle.job_id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Best-effort removal by id or name. Returns whether anything was removed.
    pub async fn remove_container(&self, id_or_name: &str) -> bool {
        match self.runtime.remove(id_or_name).await {
            Ok(()) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => {
                tracing::warn!(container = %id_or_name, error = %e, "Failed to remove container");
                false
            }
        }
    }

    pub async fn logs(&self, handle: &ContainerHandle) -> Result<String, LifecycleError> {
        Ok(self.runtime.logs(&handle.runtime_id).await?)
    }

    /// Record the outcome of a run. Returns `None` when the job had already
    /// left the expected state.
    pub async fn finalize(
        &self,
        job: &Job,
        completion: Completion,
    ) -> Result<Option<Job>, LifecycleError> {
        let (from, to, failure, exit_code) = match completion {
            Completion::Exited(0) => (RUNNING, JobStatus::Succeeded, None, Some(0)),
            Completion::Exited(code) => (
                RUNNING,
                JobStatus::Failed,
                Some(FailureReason::ExitCode { code }),
                Some(code),
            ),
            Completion::TimedOut => (RUNNING, JobStatus::Failed, Some(FailureReason::Timeout), None),
            Completion::Lost => (
                RUNNING,
                JobStatus::Failed,
                Some(FailureReason::ContainerLost),
                None,
            ),
            Completion::Canceled => (CANCELABLE, JobStatus::Canceled, None, None),
        };

        let updated = self
            .jobs
            .finish(job.id, from, to, failure, exit_code)
            .await?;
        self.cancels.remove(&job.id);
        if let Some(updated) = &updated {
            tracing::info!(job_id = %job.id, status = %updated.status, "Job finished");
            self.status_changed(job.id, job.status, updated);
        }
        Ok(updated)
    }

    /// Fail a job that never produced a completion.
    pub async fn fail(
        &self,
        job: &Job,
        reason: FailureReason,
    ) -> Result<Option<Job>, LifecycleError> {
        let updated = self
            .jobs
            .finish(job.id, ACTIVE, JobStatus::Failed, Some(reason), None)
            .await?;
        if let Some(updated) = &updated {
            self.status_changed(job.id, job.status, updated);
        }
        Ok(updated)
    }

    /// Drop in-process state for a job whose container is known to be gone.
    pub fn forget(&self, job_id: JobId) {
        self.handles.remove(&job_id);
        self.cancels.remove(&job_id);
    }
}
