mod common;

use std::collections::HashMap;
use std::time::Duration;

use actors::{CoordinatorMessage, LOG_ARTIFACT, dispatch};
use common::{TestResult, config, harness, limits, submission};
use db::repositories::ArtifactRepository;
use futures_util::StreamExt;
use orchestrator_core::{
    ContainerHandle, FailureReason, JOB_ID_LABEL, Job, JobId, JobStatus, MANAGED_LABEL,
    OrchestratorEvent, PAYLOAD_LABEL, container_name,
};
use ractor::rpc::CallResult;
use runtime::{CancelOutcome, ContainerRuntime, ContainerSpec};

const DEPS: &[&str] = &["requests==2.31", "click"];

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_jobs_sharing_dependencies_install_once() -> TestResult {
    let h = harness().await?;
    let supervisor = h.start(config()).await?;

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(supervisor.submit(submission("sleep=50;write=result.txt", DEPS)).await?);
    }

    let artifacts = ArtifactRepository::new(h.db.clone());
    for id in &ids {
        let job = supervisor.wait_terminal(*id, Duration::from_secs(10)).await?;
        assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.failure);
        assert_eq!(job.exit_code, Some(0));
        assert!(job.container.is_none());

        let paths: Vec<String> = artifacts
            .list_for_job(*id)
            .await?
            .into_iter()
            .map(|record| record.path)
            .collect();
        assert!(paths.contains(&"result.txt".to_string()));
        assert!(paths.contains(&LOG_ARTIFACT.to_string()));
    }

    assert_eq!(h.installer.count(), 1);
    let hash = orchestrator_core::DependencySpec::new(DEPS.iter().copied()).hash();
    h.wait_released(&hash).await?;
    assert!(h.runtime.container_ids().is_empty());

    assert_eq!(supervisor.collect_garbage().await?, 1);
    assert!(h.cache.entry(&hash).await?.is_none());

    supervisor.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_job_exceeding_timeout_fails_and_releases() -> TestResult {
    let h = harness().await?;
    let supervisor = h.start(config()).await?;

    let id = supervisor
        .submit(submission("hang", DEPS).with_limits(limits(1)))
        .await?;
    let job = supervisor.wait_terminal(id, Duration::from_secs(10)).await?;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure, Some(FailureReason::Timeout));
    h.wait_released(&job.dependency_hash).await?;
    assert!(h.runtime.container_ids().is_empty());

    supervisor.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_job_is_retried_until_budget_spent() -> TestResult {
    let h = harness().await?;
    let supervisor = h.start(config()).await?;

    let id = supervisor.submit(submission("unavailable", DEPS)).await?;
    let job = h
        .wait_for(id, |job| job.status == JobStatus::Failed && job.attempt_count == 2)
        .await?;

    assert_eq!(job.failure.as_ref().map(FailureReason::code), Some("transient_infra"));
    // Give a stray retry the chance to show up
    tokio::time::sleep(Duration::from_millis(200)).await;
    let job = h.jobs.get(id).await?;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 2);
    assert_eq!(h.runtime.create_calls(), 2);

    supervisor.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_duplicate_idempotency_key_creates_one_job() -> TestResult {
    let h = harness().await?;
    let coordinator = h.coordinator(config()).await?;

    let repeated = submission("exit=0", DEPS);
    let mut ids = Vec::new();
    for _ in 0..2 {
        let result = ractor::rpc::call(
            &coordinator,
            |reply| CoordinatorMessage::Enqueue {
                submission: Box::new(repeated.clone()),
                reply,
            },
            None,
        )
        .await?;
        let CallResult::Success(id) = result else {
            return Err("enqueue call failed".into());
        };
        ids.push(id?);
    }

    assert_eq!(ids[0], ids[1]);
    assert_eq!(h.jobs.count_by_status(&[JobStatus::Queued]).await?, 1);
    let stats = ractor::rpc::call(&coordinator, |reply| CoordinatorMessage::GetStats { reply }, None).await?;
    let CallResult::Success(stats) = stats else {
        return Err("stats call failed".into());
    };
    assert_eq!(stats.pending, 1);
    Ok(())
}

#[tokio::test]
async fn test_rejects_invalid_submission() -> TestResult {
    let h = harness().await?;
    let coordinator = h.coordinator(config()).await?;

    let mut bad = submission("exit=0", DEPS);
    bad.idempotency_key = String::new();
    let result = ractor::rpc::call(
        &coordinator,
        |reply| CoordinatorMessage::Enqueue {
            submission: Box::new(bad),
            reply,
        },
        None,
    )
    .await?;
    assert!(matches!(result, CallResult::Success(Err(_))));
    assert_eq!(h.jobs.count_by_status(&[JobStatus::Queued]).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_cancel_queued_job_never_creates_container() -> TestResult {
    let h = harness().await?;
    let coordinator = h.coordinator(config()).await?;

    let CallResult::Success(id) = ractor::rpc::call(
        &coordinator,
        |reply| CoordinatorMessage::Enqueue {
            submission: Box::new(submission("exit=0", DEPS)),
            reply,
        },
        None,
    )
    .await?
    else {
        return Err("enqueue call failed".into());
    };
    let id = id?;

    let CallResult::Success(outcome) = ractor::rpc::call(
        &coordinator,
        |reply| CoordinatorMessage::Cancel { job_id: id, reply },
        None,
    )
    .await?
    else {
        return Err("cancel call failed".into());
    };
    assert_eq!(outcome?, CancelOutcome::Canceled);

    // Nothing is left to dispatch
    let mut deliveries = dispatch(coordinator.clone(), 1, Duration::from_millis(10));
    let next = tokio::time::timeout(Duration::from_millis(200), deliveries.next()).await;
    assert!(next.is_err());

    assert_eq!(h.jobs.get(id).await?.status, JobStatus::Canceled);
    assert_eq!(h.runtime.create_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_unacknowledged_deliveries_come_back() -> TestResult {
    let h = harness().await?;
    let coordinator = h
        .coordinator(config().with_visibility_timeout(Duration::from_millis(100)))
        .await?;

    let mut ids = Vec::new();
    for _ in 0..2 {
        let CallResult::Success(id) = ractor::rpc::call(
            &coordinator,
            |reply| CoordinatorMessage::Enqueue {
                submission: Box::new(submission("exit=0", DEPS)),
                reply,
            },
            None,
        )
        .await?
        else {
            return Err("enqueue call failed".into());
        };
        ids.push(id?);
    }

    let mut deliveries = dispatch(coordinator.clone(), 1, Duration::from_millis(10));
    let first: Vec<JobId> = deliveries.by_ref().take(2).map(|d| d.job_id()).collect().await;
    assert_eq!(first, ids);

    // Never acked: both are handed out again after the window
    let again = tokio::time::timeout(
        Duration::from_secs(2),
        deliveries.by_ref().take(2).map(|d| d.job_id()).collect::<Vec<_>>(),
    )
    .await?;
    assert_eq!(again.len(), 2);
    assert!(again.iter().all(|id| ids.contains(id)));
    Ok(())
}

/// Insert a job and move it to `running` with a container the runtime
/// does not know about.
async fn running_without_container(h: &common::Harness) -> Result<Job, Box<dyn std::error::Error>> {
    let job = Job::from_submission(submission("hang", DEPS));
    h.jobs.insert(&job).await?;
    h.jobs.claim(job.id, "elsewhere/worker-1").await?.ok_or("claim")?;
    h.cache.ensure(&job.dependency_spec, job.id).await?;
    let handle = ContainerHandle {
        job_id: job.id,
        runtime_id: "gone".into(),
        name: container_name(job.id),
        mounts: Vec::new(),
        resource_limits: limits(10),
        started_at: chrono::Utc::now(),
    };
    Ok(h.jobs.mark_running(job.id, &handle).await?.ok_or("mark running")?)
}

#[tokio::test]
async fn test_reconciler_fails_job_whose_container_vanished() -> TestResult {
    let h = harness().await?;
    let job = running_without_container(&h).await?;
    let reconciler = h.reconciler(config());

    let report = reconciler.sweep().await?;
    assert_eq!(report.lost_jobs, vec![job.id]);

    let job = h.jobs.get(job.id).await?;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure, Some(FailureReason::ContainerLost));
    assert!(job.container.is_none());
    let entry = h.cache.entry(&job.dependency_hash).await?.ok_or("entry")?;
    assert_eq!(entry.ref_count(), 0);

    assert!(reconciler.sweep().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_reconciler_removes_orphaned_containers() -> TestResult {
    let h = harness().await?;
    let stranger = JobId::new();
    let spec = ContainerSpec {
        name: container_name(stranger),
        image: "agent:test".into(),
        env: Vec::new(),
        labels: HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (JOB_ID_LABEL.to_string(), stranger.to_string()),
            (PAYLOAD_LABEL.to_string(), "hang".to_string()),
        ]),
        mounts: Vec::new(),
        limits: limits(10),
    };
    h.runtime.create(&spec).await?;

    let reconciler = h.reconciler(config());
    let report = reconciler.sweep().await?;
    assert_eq!(report.removed_containers, vec![container_name(stranger)]);
    assert!(h.runtime.container_ids().is_empty());

    assert!(reconciler.sweep().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_reconciler_fails_abandoned_provisioning() -> TestResult {
    let h = harness().await?;
    let job = Job::from_submission(submission("exit=0", DEPS));
    h.jobs.insert(&job).await?;
    h.jobs.claim(job.id, "elsewhere/worker-1").await?.ok_or("claim")?;

    let fresh = h.reconciler(config()).sweep().await?;
    assert!(fresh.stale_provisioning.is_empty());

    let reconciler = h.reconciler(config().with_stale_provisioning(Duration::ZERO));
    let report = reconciler.sweep().await?;
    assert_eq!(report.stale_provisioning, vec![job.id]);
    assert_eq!(
        h.jobs.get(job.id).await?.failure,
        Some(FailureReason::ProvisionTimeout)
    );
    assert!(reconciler.sweep().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_reconciler_skips_container_checks_when_runtime_is_down() -> TestResult {
    let h = harness().await?;
    let job = running_without_container(&h).await?;
    h.runtime.set_unavailable(true);

    let report = h.reconciler(config()).sweep().await?;
    assert!(report.runtime_skipped);
    assert!(report.lost_jobs.is_empty());
    assert_eq!(h.jobs.get(job.id).await?.status, JobStatus::Running);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flush_cancels_running_jobs_and_purges_cache() -> TestResult {
    let h = harness().await?;
    let supervisor = h.start(config()).await?;

    let id = supervisor
        .submit(submission("hang", DEPS).with_limits(limits(60)))
        .await?;
    h.wait_for(id, |job| job.status == JobStatus::Running).await?;

    let report = supervisor.flush().await?;
    assert_eq!(report.canceled, 1);

    let job = h.jobs.get(id).await?;
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(job.container.is_none());
    assert!(h.cache.entries().await?.is_empty());
    assert!(h.runtime.list_running().await?.is_empty());

    // Dispatch resumes afterwards
    let next = supervisor.submit(submission("exit=0", DEPS)).await?;
    let next = supervisor.wait_terminal(next, Duration::from_secs(10)).await?;
    assert_eq!(next.status, JobStatus::Succeeded);
    assert_eq!(h.installer.count(), 2);

    supervisor.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_running_job_through_supervisor() -> TestResult {
    let h = harness().await?;
    let supervisor = h.start(config()).await?;
    let mut events = supervisor.subscribe().await?;

    let id = supervisor
        .submit(submission("hang", DEPS).with_limits(limits(60)))
        .await?;
    h.wait_for(id, |job| job.status == JobStatus::Running).await?;

    assert_eq!(supervisor.cancel(id).await?, CancelOutcome::Signaled);
    let job = supervisor.wait_terminal(id, Duration::from_secs(10)).await?;
    assert_eq!(job.status, JobStatus::Canceled);
    assert_eq!(
        supervisor.cancel(id).await?,
        CancelOutcome::AlreadyTerminal(JobStatus::Canceled)
    );

    let mut saw_claim = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, OrchestratorEvent::JobClaimed { job_id, .. } if job_id == id)
        {
            saw_claim = true;
        }
    }
    assert!(saw_claim);

    supervisor.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_package_reference_outlives_the_running_job() -> TestResult {
    let h = harness().await?;
    let supervisor = h.start(config()).await?;
    let mut events = supervisor.subscribe().await?;

    let id = supervisor.submit(submission("exit=0", DEPS)).await?;
    let job = supervisor.wait_terminal(id, Duration::from_secs(10)).await?;
    h.wait_released(&job.dependency_hash).await?;

    let mut finished_at = None;
    let mut released_at = None;
    let mut position = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            OrchestratorEvent::JobStatusChanged {
                job_id, new_status, ..
            } if job_id == id && new_status.is_terminal() => finished_at = Some(position),
            OrchestratorEvent::PackageReleased { job_id, .. } if job_id == id => {
                released_at = Some(position)
            }
            _ => {}
        }
        position += 1;
    }
    let (finished_at, released_at) = (finished_at.ok_or("no terminal status")?, released_at.ok_or("no release")?);
    assert!(finished_at < released_at);

    supervisor.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_reconciler_keeps_job_whose_container_exited_uncollected() -> TestResult {
    let h = harness().await?;
    let job = Job::from_submission(submission("exit=0", DEPS));
    h.jobs.insert(&job).await?;
    h.jobs.claim(job.id, "elsewhere/worker-1").await?.ok_or("claim")?;

    let other = h.lifecycle_peer();
    let handle = other.provision(&job, Vec::new()).await?;
    assert_eq!(h.runtime.wait(&handle.runtime_id).await?, 0);
    assert!(h.runtime.list_running().await?.is_empty());

    let report = h.reconciler(config()).sweep().await?;
    assert!(report.lost_jobs.is_empty());
    assert!(report.removed_containers.is_empty());
    assert_eq!(h.jobs.get(job.id).await?.status, JobStatus::Running);

    // The owner still records the exit it saw
    let completion = other.await_completion(&handle).await?;
    let done = other
        .finalize(&h.jobs.get(job.id).await?, completion)
        .await?
        .ok_or("finalize")?;
    assert_eq!(done.status, JobStatus::Succeeded);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_flush_leaves_cache_alone_when_drain_times_out() -> TestResult {
    let h = harness().await?;
    let supervisor = h
        .start(config().with_drain_timeout(Duration::from_millis(100)))
        .await?;

    // Owned by a worker in another process that never answers the cancel
    let stuck = Job::from_submission(submission("hang", DEPS));
    h.jobs.insert(&stuck).await?;
    h.jobs.claim(stuck.id, "elsewhere/worker-1").await?.ok_or("claim")?;
    let package_dir = h.cache.ensure(&stuck.dependency_spec, stuck.id).await?;

    let installing = orchestrator_core::DependencySpec::new(["numpy==2.0"]).hash();
    let lease = h
        .cache
        .leases()
        .try_acquire(&installing)
        .await?
        .ok_or("lease")?;

    let err = supervisor.flush().await.err().ok_or("flush should fail")?;
    assert!(err.to_string().contains("drain timed out"), "{err}");

    let entry = h.cache.entry(&stuck.dependency_hash).await?.ok_or("entry purged")?;
    assert_eq!(entry.ref_count(), 1);
    assert!(package_dir.exists());
    assert!(h.cache.leases().is_held(&installing).await?);
    let stuck_now = h.jobs.get(stuck.id).await?;
    assert_eq!(stuck_now.status, JobStatus::Provisioning);
    assert!(stuck_now.cancel_requested);
    lease.release().await;

    // Dispatch resumes even though the flush failed
    let next = supervisor.submit(submission("exit=0", DEPS)).await?;
    let next = supervisor.wait_terminal(next, Duration::from_secs(10)).await?;
    assert_eq!(next.status, JobStatus::Succeeded);

    supervisor.shutdown();
    Ok(())
}
