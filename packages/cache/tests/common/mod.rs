#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use cache::{CacheConfig, CacheError, InstallError, InstallFuture, PackageCache, PackageInstaller};
use db::{Database, DbConfig};
use orchestrator_core::DependencySpec;
use tempfile::TempDir;

/// Installer that writes the requested lines to `deps.txt` and counts calls.
#[derive(Default)]
pub struct RecordingInstaller {
    pub installs: AtomicUsize,
    pub fail: AtomicBool,
    pub delay: Duration,
}

impl RecordingInstaller {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

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
            tokio::time::sleep(self.delay).await;
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
    pub installer: Arc<RecordingInstaller>,
    pub cache: Arc<PackageCache>,
}

pub fn config(dir: &Path) -> CacheConfig {
    CacheConfig::new(dir.join("packages"))
        .with_lease_ttl(Duration::from_secs(30))
        .with_lease_grace(Duration::from_millis(0))
        .with_lease_timeout(Duration::from_secs(10))
        .with_poll_interval(Duration::from_millis(10))
        .with_retention(Duration::ZERO)
}

pub async fn harness(installer: RecordingInstaller) -> Result<Harness, CacheError> {
    harness_with(installer, config).await
}

pub async fn harness_with(
    installer: RecordingInstaller,
    configure: impl FnOnce(&Path) -> CacheConfig,
) -> Result<Harness, CacheError> {
    let dir = tempfile::tempdir()?;
    let db = db::init(&DbConfig::memory()).await?;
    let installer = Arc::new(installer);
    let cache = PackageCache::new(configure(dir.path()), db.clone(), installer.clone()).await?;
    Ok(Harness {
        dir,
        db,
        installer,
        cache: Arc::new(cache),
    })
}
