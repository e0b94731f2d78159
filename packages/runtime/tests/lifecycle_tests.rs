#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::time::Duration;

use common::{harness, harness_with, job, limits};
use orchestrator_core::{FailureReason, JobStatus, ResourceLimits, container_name};
use runtime::{CancelOutcome, Completion, ContainerRuntime, LifecycleError};

#[tokio::test]
async fn test_job_without_limits_never_reaches_runtime() -> Result<(), Box<dyn Error>> {
    let h = harness().await?;
    for bad in [None, Some(ResourceLimits::new(0.0, 128, 10))] {
        let claimed = h.claimed(job("exit=0", bad)).await?;
        let result = h.lifecycle.provision(&claimed, Vec::new()).await;
        assert!(matches!(result, Err(LifecycleError::MissingLimits(_))));

        let stored = h.jobs.get(claimed.id).await?;
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.failure, Some(FailureReason::MissingLimits));
    }
    assert_eq!(h.runtime.create_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_successful_run_and_idempotent_teardown() -> Result<(), Box<dyn Error>> {
    let h = harness().await?;
    let claimed = h.claimed(job("sleep=20", limits(10))).await?;

    let handle = h.lifecycle.provision(&claimed, Vec::new()).await?;
    assert_eq!(handle.name, container_name(claimed.id));
    let again = h.lifecycle.provision(&claimed, Vec::new()).await?;
    assert_eq!(again, handle);
    assert_eq!(h.runtime.create_calls(), 1);

    let created = &h.runtime.created()[0];
    assert_eq!(created.env_var("JOB_ID"), Some(claimed.id.to_string().as_str()));
    assert_eq!(created.env_var("PACKAGE_PATH"), Some("/opt/packages"));
    assert_eq!(created.labels["sibling.managed"], "true");

    let running = h.jobs.get(claimed.id).await?;
    assert_eq!(running.status, JobStatus::Running);
    assert_eq!(running.container.as_ref(), Some(&handle));

    let completion = h.lifecycle.await_completion(&handle).await?;
    assert_eq!(completion, Completion::Exited(0));
    let done = h
        .lifecycle
        .finalize(&running, completion)
        .await?
        .ok_or("finalize")?;
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.exit_code, Some(0));

    h.lifecycle.teardown(&handle).await?;
    h.lifecycle.teardown(&handle).await?;
    assert!(h.runtime.container_ids().is_empty());
    assert!(h.lifecycle.handle(claimed.id).is_none());
    assert!(h.jobs.get(claimed.id).await?.container.is_none());
    Ok(())
}

#[tokio::test]
async fn test_non_zero_exit_is_recorded() -> Result<(), Box<dyn Error>> {
    let h = harness().await?;
    let claimed = h.claimed(job("exit=3", limits(10))).await?;
    let handle = h.lifecycle.provision(&claimed, Vec::new()).await?;

    let completion = h.lifecycle.await_completion(&handle).await?;
    let failed = h
        .lifecycle
        .finalize(&claimed, completion)
        .await?
        .ok_or("finalize")?;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failure, Some(FailureReason::ExitCode { code: 3 }));
    assert!(h.lifecycle.logs(&handle).await?.contains("exited with 3"));
    Ok(())
}

#[tokio::test]
async fn test_timeout_stops_container() -> Result<(), Box<dyn Error>> {
    let h = harness().await?;
    let claimed = h.claimed(job("hang", limits(1))).await?;
    let handle = h.lifecycle.provision(&claimed, Vec::new()).await?;

    let completion = h.lifecycle.await_completion(&handle).await?;
    assert_eq!(completion, Completion::TimedOut);
    assert!(h.runtime.list_running().await?.is_empty());

    let failed = h
        .lifecycle
        .finalize(&claimed, completion)
        .await?
        .ok_or("finalize")?;
    assert_eq!(failed.failure, Some(FailureReason::Timeout));
    Ok(())
}

#[tokio::test]
async fn test_cancel_queued_job_skips_runtime() -> Result<(), Box<dyn Error>> {
    let h = harness().await?;
    let queued = job("exit=0", limits(10));
    h.jobs.insert(&queued).await?;

    assert_eq!(h.lifecycle.cancel(queued.id).await?, CancelOutcome::Canceled);
    assert_eq!(h.jobs.get(queued.id).await?.status, JobStatus::Canceled);
    assert!(h.jobs.claim(queued.id, "worker-1").await?.is_none());
    assert_eq!(
        h.lifecycle.cancel(queued.id).await?,
        CancelOutcome::AlreadyTerminal(JobStatus::Canceled)
    );
    assert_eq!(
        h.lifecycle.cancel(orchestrator_core::JobId::new()).await?,
        CancelOutcome::NotFound
    );
    assert_eq!(h.runtime.create_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_cancel_running_job_stops_it() -> Result<(), Box<dyn Error>> {
    let h = harness().await?;
    let claimed = h.claimed(job("hang", limits(60))).await?;
    let handle = h.lifecycle.provision(&claimed, Vec::new()).await?;

    let lifecycle = h.lifecycle.clone();
    let waiter = tokio::spawn({
        let handle = handle.clone();
        async move { lifecycle.await_completion(&handle).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.lifecycle.cancel(claimed.id).await?, CancelOutcome::Signaled);

    let completion = waiter.await??;
    assert_eq!(completion, Completion::Canceled);
    let canceled = h
        .lifecycle
        .finalize(&claimed, completion)
        .await?
        .ok_or("finalize")?;
    assert_eq!(canceled.status, JobStatus::Canceled);
    assert!(!h.lifecycle.is_cancel_requested(claimed.id));
    Ok(())
}

#[tokio::test]
async fn test_slow_create_fails_with_provision_timeout() -> Result<(), Box<dyn Error>> {
    let h = harness_with(common::config().with_provision_timeout(Duration::from_millis(50))).await?;
    let claimed = h.claimed(job("create-delay=2000", limits(10))).await?;

    let result = h.lifecycle.provision(&claimed, Vec::new()).await;
    assert!(matches!(
        result,
        Err(LifecycleError::Provision {
            reason: FailureReason::ProvisionTimeout,
            ..
        })
    ));
    let stored = h.jobs.get(claimed.id).await?;
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.failure, Some(FailureReason::ProvisionTimeout));
    assert!(h.runtime.container_ids().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unreachable_runtime_is_transient() -> Result<(), Box<dyn Error>> {
    let h = harness().await?;
    let claimed = h.claimed(job("unavailable", limits(10))).await?;

    let err = h
        .lifecycle
        .provision(&claimed, Vec::new())
        .await
        .err()
        .ok_or("expected failure")?;
    let reason = err.failure().ok_or("reason")?;
    assert!(reason.is_retryable());
    assert_eq!(h.jobs.get(claimed.id).await?.failure, Some(reason));
    Ok(())
}

#[tokio::test]
async fn test_vanished_container_is_lost_and_teardown_succeeds() -> Result<(), Box<dyn Error>> {
    let h = harness().await?;
    let claimed = h.claimed(job("hang", limits(60))).await?;
    let handle = h.lifecycle.provision(&claimed, Vec::new()).await?;

    let lifecycle = h.lifecycle.clone();
    let waiter = tokio::spawn({
        let handle = handle.clone();
        async move { lifecycle.await_completion(&handle).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.runtime.forget(&handle.runtime_id));

    assert_eq!(waiter.await??, Completion::Lost);
    h.lifecycle.teardown(&handle).await?;
    let failed = h
        .lifecycle
        .finalize(&claimed, Completion::Lost)
        .await?
        .ok_or("finalize")?;
    assert_eq!(failed.failure, Some(FailureReason::ContainerLost));
    Ok(())
}

#[tokio::test]
async fn test_cancel_from_another_process_stops_running_job() -> Result<(), Box<dyn Error>> {
    let h = harness().await?;
    let claimed = h.claimed(job("hang", limits(60))).await?;
    let handle = h.lifecycle.provision(&claimed, Vec::new()).await?;

    let lifecycle = h.lifecycle.clone();
    let waiter = tokio::spawn({
        let handle = handle.clone();
        async move { lifecycle.await_completion(&handle).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let other = h.peer();
    assert_eq!(other.cancel(claimed.id).await?, CancelOutcome::Signaled);
    assert!(h.jobs.get(claimed.id).await?.cancel_requested);

    let completion = tokio::time::timeout(Duration::from_secs(5), waiter).await???;
    assert_eq!(completion, Completion::Canceled);
    let canceled = h
        .lifecycle
        .finalize(&claimed, completion)
        .await?
        .ok_or("finalize")?;
    assert_eq!(canceled.status, JobStatus::Canceled);
    assert_eq!(
        other.cancel(claimed.id).await?,
        CancelOutcome::AlreadyTerminal(JobStatus::Canceled)
    );
    Ok(())
}

#[tokio::test]
async fn test_cancel_from_another_process_blocks_provision() -> Result<(), Box<dyn Error>> {
    let h = harness().await?;
    let claimed = h.claimed(job("exit=0", limits(10))).await?;

    assert_eq!(h.peer().cancel(claimed.id).await?, CancelOutcome::Signaled);
    let result = h.lifecycle.provision(&claimed, Vec::new()).await;
    assert!(matches!(result, Err(LifecycleError::Canceled(_))));
    assert_eq!(h.runtime.create_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_container_is_removed_when_running_state_cannot_be_recorded() -> Result<(), Box<dyn Error>> {
    let h = harness().await?;
    let claimed = h.claimed(job("hang", limits(10))).await?;
    // Any write that moves a job to running now fails
    h.db.query("DEFINE FIELD status ON TABLE job ASSERT $value != 'running'")
        .await?
        .check()?;

    let result = h.lifecycle.provision(&claimed, Vec::new()).await;
    assert!(matches!(result, Err(LifecycleError::Db(_))));
    assert_eq!(h.runtime.create_calls(), 1);
    assert!(h.runtime.container_ids().is_empty());
    assert!(h.lifecycle.handle(claimed.id).is_none());
    Ok(())
}
