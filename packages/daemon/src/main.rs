//! Sibling container orchestrator daemon.
//!
//! Reads its configuration from the environment, connects the database and
//! the Docker daemon, and runs the supervisor until Ctrl-C.

mod config;

use std::sync::Arc;

use actors::{SupervisorArgs, start_supervisor};
use cache::{CommandInstaller, PackageCache};
use runtime::{DockerRuntime, LifecycleManager, MountPlan, PathMapping};
use storage::ArtifactStore;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use crate::config::{DaemonConfig, DaemonError};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Orchestrator stopped with an error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), DaemonError> {
    let config = DaemonConfig::from_env()?;
    tracing::info!(
        instance = %config.orchestrator.instance_id,
        workers = config.orchestrator.worker_concurrency,
        image = %config.lifecycle.image,
        "Starting orchestrator"
    );

    let db = db::init(&config.db).await?;
    let (events, _) = broadcast::channel(1024);

    let docker = DockerRuntime::connect().await?;
    tracing::info!("Connected to Docker");

    let cache = PackageCache::new(
        config.cache.clone(),
        db.clone(),
        Arc::new(CommandInstaller::from_env()),
    )
    .await?
    .with_events(events.clone());

    let artifacts = ArtifactStore::new(config.artifacts.clone()).await?;

    let mounts = MountPlan::new(
        mapping(cache.root(), config.host_roots.cache.as_deref()),
        mapping(artifacts.root(), config.host_roots.artifacts.as_deref()),
    );

    let lifecycle = LifecycleManager::new(config.lifecycle.clone(), Arc::new(docker), db.clone())
        .with_events(events.clone());

    let (supervisor, handle) = start_supervisor(SupervisorArgs {
        config: config.orchestrator.clone(),
        db,
        cache: Arc::new(cache),
        lifecycle: Arc::new(lifecycle),
        artifacts,
        mounts,
        events: events.clone(),
    })
    .await?;

    let mut log_events = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = log_events.recv().await {
            tracing::debug!(event = %event.description(), "Orchestrator event");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    supervisor.shutdown();
    let _ = handle.await;
    tracing::info!("Orchestrator stopped");
    Ok(())
}

fn mapping(local: &std::path::Path, host: Option<&std::path::Path>) -> PathMapping {
    match host {
        Some(host) => PathMapping::new(local, host),
        None => PathMapping::identity(local),
    }
}
