mod common;

use std::collections::HashMap;
use std::error::Error;
use std::time::Duration;

use cache::{CacheError, LeaseRecord};
use chrono::Utc;
use common::{RecordingInstaller, harness, harness_with};
use db::repositories::PackageRepository;
use orchestrator_core::{DependencySpec, JobId, PackageEntry, PackageState};

fn spec() -> DependencySpec {
    DependencySpec::new(["requests==2.31", "click"])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ensure_installs_once() -> Result<(), Box<dyn Error>> {
    let h = harness(RecordingInstaller::with_delay(Duration::from_millis(200))).await?;

    let mut tasks = Vec::new();
    let mut jobs = Vec::new();
    for _ in 0..6 {
        let cache = h.cache.clone();
        let job = JobId::new();
        jobs.push(job);
        tasks.push(tokio::spawn(async move { cache.ensure(&spec(), job).await }));
    }

    let mut paths = Vec::new();
    for task in tasks {
        paths.push(task.await??);
    }
    assert_eq!(h.installer.count(), 1);
    assert!(paths.windows(2).all(|w| w[0] == w[1]));
    assert!(paths[0].join("deps.txt").exists());
    assert!(paths[0].join(".ready").exists());

    let hash = spec().hash();
    let entry = h.cache.entry(&hash).await?.ok_or("entry")?;
    assert_eq!(entry.state, PackageState::Ready);
    assert_eq!(entry.ref_count(), 6);
    assert_eq!(h.cache.entries().await?.len(), 1);

    for job in jobs {
        assert!(h.cache.release(&hash, job).await?);
        assert!(!h.cache.release(&hash, job).await?);
    }
    assert_eq!(h.cache.entry(&hash).await?.ok_or("entry")?.ref_count(), 0);

    let evicted = h.cache.collect_garbage().await?;
    assert_eq!(evicted, vec![hash.clone()]);
    assert!(!paths[0].exists());
    assert!(h.cache.entry(&hash).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_garbage_collection_spares_held_and_recent_entries() -> Result<(), Box<dyn Error>> {
    let h = harness_with(RecordingInstaller::default(), |dir| {
        common::config(dir).with_retention(Duration::from_secs(3600))
    })
    .await?;
    let job = JobId::new();
    let hash = spec().hash();
    h.cache.ensure(&spec(), job).await?;

    // Held
    assert!(h.cache.collect_garbage().await?.is_empty());

    // Unheld but used moments ago
    h.cache.release(&hash, job).await?;
    assert!(h.cache.collect_garbage().await?.is_empty());
    assert!(h.cache.path_for(&hash).exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_install_reaches_every_waiter_then_retries() -> Result<(), Box<dyn Error>> {
    let installer = RecordingInstaller::with_delay(Duration::from_millis(200));
    installer.set_failing(true);
    let h = harness(installer).await?;

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let cache = h.cache.clone();
        tasks.push(tokio::spawn(async move { cache.ensure(&spec(), JobId::new()).await }));
    }
    for task in tasks {
        let result = task.await?;
        assert!(
            matches!(result, Err(CacheError::Install { .. })),
            "expected install failure, got {result:?}"
        );
    }
    assert_eq!(h.installer.count(), 1);

    let hash = spec().hash();
    let failed = h.cache.entry(&hash).await?.ok_or("entry")?;
    assert_eq!(failed.state, PackageState::Failed);
    assert_eq!(failed.error.as_deref(), Some("resolver conflict"));

    h.installer.set_failing(false);
    let path = h.cache.ensure(&spec(), JobId::new()).await?;
    assert!(path.join("deps.txt").exists());
    assert_eq!(h.installer.count(), 2);
    assert_eq!(h.cache.entries().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_abandoned_lease_is_reclaimed_after_grace() -> Result<(), Box<dyn Error>> {
    let h = harness(RecordingInstaller::default()).await?;
    let hash = spec().hash();

    // A worker died mid-install: pending row, expired lease, staging dir
    let repo = PackageRepository::new(h.db.clone());
    repo.upsert(&PackageEntry::pending(hash.clone(), h.cache.path_for(&hash), spec()))
        .await?;
    let dead = LeaseRecord {
        holder: "dead".into(),
        acquired_at: Utc::now() - chrono::Duration::minutes(5),
        expires_at: Utc::now() - chrono::Duration::minutes(4),
    };
    tokio::fs::write(
        h.cache.leases().path_for(&hash),
        serde_json::to_vec(&dead)?,
    )
    .await?;
    let staging = h
        .cache
        .root()
        .join(".tmp")
        .join(format!("{}-{}", hash, ulid::Ulid::new()));
    tokio::fs::create_dir_all(&staging).await?;

    let path = h.cache.ensure(&spec(), JobId::new()).await?;
    assert!(path.join("deps.txt").exists());
    assert_eq!(h.installer.count(), 1);
    assert_eq!(h.cache.entries().await?.len(), 1);

    let report = h.cache.reconcile().await?;
    assert_eq!(report.removed_staging, 1);
    assert!(h.cache.reconcile().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_live_lease_times_out_waiters() -> Result<(), Box<dyn Error>> {
    let h = harness_with(RecordingInstaller::default(), |dir| {
        common::config(dir).with_lease_timeout(Duration::from_millis(100))
    })
    .await?;
    let hash = spec().hash();
    let _held = h.cache.leases().try_acquire(&hash).await?.ok_or("lease")?;

    let result = h.cache.ensure(&spec(), JobId::new()).await;
    assert!(matches!(result, Err(CacheError::LeaseTimeout(_))));
    assert_eq!(h.installer.count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_reconcile_repairs_drift_and_is_idempotent() -> Result<(), Box<dyn Error>> {
    let h = harness(RecordingInstaller::default()).await?;
    let repo = PackageRepository::new(h.db.clone());

    // Published entry whose row was lost
    let adopted = DependencySpec::new(["adopt-me"]);
    h.cache.ensure(&adopted, JobId::new()).await?;
    repo.delete(&adopted.hash()).await?;

    // Ready row whose directory vanished
    let vanished = DependencySpec::new(["vanished"]);
    let path = h.cache.ensure(&vanished, JobId::new()).await?;
    tokio::fs::remove_dir_all(&path).await?;

    // Pending row nobody is installing
    let orphan_row = DependencySpec::new(["orphan-row"]);
    repo.upsert(&PackageEntry::pending(
        orphan_row.hash(),
        h.cache.path_for(&orphan_row.hash()),
        orphan_row.clone(),
    ))
    .await?;

    // Directory without marker or row
    let partial = DependencySpec::new(["partial"]).hash();
    tokio::fs::create_dir_all(h.cache.path_for(&partial)).await?;

    let report = h.cache.reconcile().await?;
    assert_eq!(report.adopted, vec![adopted.hash()]);
    assert_eq!(report.removed_dirs, vec![partial.clone()]);
    let mut dropped = report.dropped_rows.clone();
    dropped.sort();
    let mut expected = vec![vanished.hash(), orphan_row.hash()];
    expected.sort();
    assert_eq!(dropped, expected);

    let adopted_entry = h.cache.entry(&adopted.hash()).await?.ok_or("adopted")?;
    assert_eq!(adopted_entry.state, PackageState::Ready);
    assert_eq!(adopted_entry.ref_count(), 0);
    assert!(!h.cache.path_for(&partial).exists());

    let second = h.cache.reconcile().await?;
    assert!(second.is_empty(), "second pass repaired {second:?}");
    Ok(())
}

#[tokio::test]
async fn test_corrupt_index_blocks_until_rebuilt() -> Result<(), Box<dyn Error>> {
    let h = harness(RecordingInstaller::default()).await?;
    let job = JobId::new();
    let hash = spec().hash();
    h.cache.ensure(&spec(), job).await?;

    h.db.query("CREATE package:garbage SET state = 7").await?.check()?;

    let report = h.cache.reconcile().await?;
    assert!(report.index_corrupt);
    assert!(!h.cache.is_healthy());
    assert!(matches!(
        h.cache.ensure(&spec(), JobId::new()).await,
        Err(CacheError::Unhealthy)
    ));

    let active = HashMap::from([(hash.clone(), vec![job])]);
    let rebuilt = h.cache.rebuild_index(&active).await?;
    assert_eq!(rebuilt.restored, vec![hash.clone()]);
    assert!(h.cache.is_healthy());

    let entry = h.cache.entry(&hash).await?.ok_or("entry")?;
    assert_eq!(entry.holders, vec![job]);
    assert_eq!(h.installer.count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_purge_removes_everything() -> Result<(), Box<dyn Error>> {
    let h = harness(RecordingInstaller::default()).await?;
    let path = h.cache.ensure(&spec(), JobId::new()).await?;

    h.cache.purge_all().await?;
    assert!(!path.exists());
    assert!(h.cache.entries().await?.is_empty());

    // Usable again afterwards
    h.cache.ensure(&spec(), JobId::new()).await?;
    assert_eq!(h.installer.count(), 2);
    Ok(())
}
