#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use db::repositories::JobRepository;
use db::{Database, DbConfig};
use orchestrator_core::{Job, JobId, JobSubmission, ResourceLimits};
use runtime::{FakeRuntime, LifecycleConfig, LifecycleManager};

pub struct Harness {
    pub db: Database,
    pub jobs: JobRepository,
    pub runtime: FakeRuntime,
    pub lifecycle: Arc<LifecycleManager>,
}

pub fn config() -> LifecycleConfig {
    LifecycleConfig::new("agent:test")
        .with_provision_timeout(Duration::from_secs(5))
        .with_poll_interval(Duration::from_millis(10))
}

pub async fn harness() -> Result<Harness, Box<dyn std::error::Error>> {
    harness_with(config()).await
}

pub async fn harness_with(config: LifecycleConfig) -> Result<Harness, Box<dyn std::error::Error>> {
    let db = db::init(&DbConfig::memory()).await?;
    let runtime = FakeRuntime::new();
    let lifecycle = LifecycleManager::new(config, Arc::new(runtime.clone()), db.clone());
    Ok(Harness {
        jobs: JobRepository::new(db.clone()),
        db,
        runtime,
        lifecycle: Arc::new(lifecycle),
    })
}

/// A job whose fake container follows the `payload` script.
pub fn job(payload: &str, limits: Option<ResourceLimits>) -> Job {
    let mut submission = JobSubmission::new(JobId::new().to_string(), payload);
    submission.resource_limits = limits;
    Job::from_submission(submission)
}

pub fn limits(timeout_secs: u64) -> Option<ResourceLimits> {
    Some(ResourceLimits::new(0.5, 128, timeout_secs))
}

impl Harness {
    /// Another manager on the same database and runtime, as a second
    /// orchestrator process would have.
    pub fn peer(&self) -> LifecycleManager {
        LifecycleManager::new(config(), Arc::new(self.runtime.clone()), self.db.clone())
    }

    /// Insert and claim a job, as a worker would before provisioning.
    pub async fn claimed(&self, job: Job) -> Result<Job, Box<dyn std::error::Error>> {
        self.jobs.insert(&job).await?;
        Ok(self.jobs.claim(job.id, "worker-1").await?.ok_or("claim")?)
    }
}
