#![allow(dead_code)]

use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use actors::{
    CoordinatorActor, CoordinatorArgs, CoordinatorMessage, OrchestratorConfig, Reconciler,
    SupervisorArgs, SupervisorHandle, start_supervisor,
};
use cache::{CacheConfig, InstallError, InstallFuture, PackageCache, PackageInstaller};
use dashmap::DashSet;
use db::repositories::JobRepository;
use db::{Database, DbConfig};
use orchestrator_core::{
    DependencyHash, DependencySpec, Job, JobId, JobSubmission, OrchestratorEvent, ResourceLimits,
};
use ractor::{Actor, ActorRef};
use runtime::{FakeRuntime, LifecycleConfig, LifecycleManager, MountPlan, PathMapping};
use storage::{ArtifactStore, ArtifactStoreConfig};
use tempfile::TempDir;
use tokio::sync::broadcast;

pub type TestResult = Result<(), Box<dyn Error>>;

/// Installer that writes the requested lines to `deps.txt` and counts calls.
#[derive(Default)]
pub struct RecordingInstaller {
    pub installs: AtomicUsize,
    pub fail: AtomicBool,
}

impl RecordingInstaller {
    pub fn count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl PackageInstaller for RecordingInstaller {
    fn install<'a>(&'a self, spec: &'a DependencySpec, target: &'a Path) -> InstallFuture<'a> {
        Box::pin(async move {
            self.installs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(InstallError::Other("resolver conflict".into()));
            }
            tokio::fs::write(target.join("deps.txt"), spec.lines().join("\n")).await?;
            Ok(())
        })
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub db: Database,
    pub jobs: JobRepository,
    pub runtime: FakeRuntime,
    pub installer: Arc<RecordingInstaller>,
    pub cache: Arc<PackageCache>,
    pub lifecycle: Arc<LifecycleManager>,
    pub store: ArtifactStore,
    pub events: broadcast::Sender<OrchestratorEvent>,
}

/// Fast timings; periodic sweeps are pushed out so tests drive them.
pub fn config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_worker_concurrency(3)
        .with_max_attempts(2)
        .with_visibility_timeout(Duration::from_secs(5))
        .with_retry_backoff(Duration::from_millis(10), Duration::from_millis(50))
        .with_dispatch_poll(Duration::from_millis(10))
        .with_tick_interval(Duration::from_millis(20))
        .with_reconcile_interval(Duration::from_secs(3600))
        .with_gc_interval(Duration::from_secs(3600))
        .with_drain_timeout(Duration::from_secs(5))
}

fn lifecycle_config() -> LifecycleConfig {
    LifecycleConfig::new("agent:test")
        .with_provision_timeout(Duration::from_secs(5))
        .with_poll_interval(Duration::from_millis(10))
}

pub async fn harness() -> Result<Harness, Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let db = db::init(&DbConfig::memory()).await?;
    let (events, _) = broadcast::channel(1024);

    let installer = Arc::new(RecordingInstaller::default());
    let cache_config = CacheConfig::new(dir.path().join("packages"))
        .with_lease_grace(Duration::ZERO)
        .with_lease_timeout(Duration::from_secs(10))
        .with_poll_interval(Duration::from_millis(10))
        .with_retention(Duration::ZERO);
    let cache = PackageCache::new(cache_config, db.clone(), installer.clone())
        .await?
        .with_events(events.clone());

    let runtime = FakeRuntime::new();
    let lifecycle = LifecycleManager::new(lifecycle_config(), Arc::new(runtime.clone()), db.clone())
        .with_events(events.clone());

    let store = ArtifactStore::new(ArtifactStoreConfig::new(dir.path().join("artifacts"))).await?;

    Ok(Harness {
        jobs: JobRepository::new(db.clone()),
        dir,
        db,
        runtime,
        installer,
        cache: Arc::new(cache),
        lifecycle: Arc::new(lifecycle),
        store,
        events,
    })
}

pub fn limits(timeout_secs: u64) -> ResourceLimits {
    ResourceLimits::new(0.5, 128, timeout_secs)
}

/// A submission whose fake container follows the `payload` script.
pub fn submission(payload: &str, deps: &[&str]) -> JobSubmission {
    JobSubmission::new(JobId::new().to_string(), payload)
        .with_dependencies(deps.iter().copied())
        .with_limits(limits(10))
}

impl Harness {
    pub fn mounts(&self) -> MountPlan {
        MountPlan::new(
            PathMapping::identity(self.cache.root()),
            PathMapping::identity(self.store.root()),
        )
    }

    pub async fn start(&self, config: OrchestratorConfig) -> Result<SupervisorHandle, Box<dyn Error>> {
        let (supervisor, _) = start_supervisor(SupervisorArgs {
            config,
            db: self.db.clone(),
            cache: self.cache.clone(),
            lifecycle: self.lifecycle.clone(),
            artifacts: self.store.clone(),
            mounts: self.mounts(),
            events: self.events.clone(),
        })
        .await?;
        Ok(supervisor)
    }

    /// A lifecycle manager standing in for another orchestrator process.
    pub fn lifecycle_peer(&self) -> LifecycleManager {
        LifecycleManager::new(lifecycle_config(), Arc::new(self.runtime.clone()), self.db.clone())
    }

    /// A coordinator with no workers behind it.
    pub async fn coordinator(
        &self,
        config: OrchestratorConfig,
    ) -> Result<ActorRef<CoordinatorMessage>, Box<dyn Error>> {
        let (coordinator, _) = Actor::spawn(
            None,
            CoordinatorActor,
            CoordinatorArgs {
                config,
                jobs: self.jobs.clone(),
                lifecycle: self.lifecycle.clone(),
                event_tx: Some(self.events.clone()),
            },
        )
        .await?;
        Ok(coordinator)
    }

    pub fn reconciler(&self, config: OrchestratorConfig) -> Reconciler {
        Reconciler::new(
            config,
            self.jobs.clone(),
            self.lifecycle.clone(),
            self.cache.clone(),
            Arc::new(DashSet::new()),
        )
    }

    /// Poll until `done` holds for the job or five seconds pass.
    pub async fn wait_for(
        &self,
        job_id: JobId,
        done: impl Fn(&Job) -> bool,
    ) -> Result<Job, Box<dyn Error>> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(job) = self.jobs.find(job_id).await?
                && done(&job)
            {
                return Ok(job);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(format!("job {job_id} did not reach the expected state").into());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until no job holds the package entry for `hash`.
    pub async fn wait_released(&self, hash: &DependencyHash) -> Result<(), Box<dyn Error>> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let entry = self.cache.entry(hash).await?.ok_or("package entry missing")?;
            if entry.ref_count() == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(format!("package {hash} is still referenced").into());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
