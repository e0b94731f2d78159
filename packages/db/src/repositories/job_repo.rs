//! Job repository.
//!
//! Every status change is a conditional update on the current status, so
//! concurrent workers and the reconciler never overwrite each other's
//! terminal decisions.

use chrono::{DateTime, Utc};
use orchestrator_core::{
    ContainerHandle, DependencyHash, DependencySpec, FailureReason, Job, JobId, JobStatus,
    ResourceLimits,
};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::{Database, DbError, retry_on_conflict};

/// Repository for job persistence operations.
#[derive(Clone)]
pub struct JobRepository {
    db: Database,
}

/// Internal record type for SurrealDB.
#[derive(Debug, Serialize, Deserialize)]
struct JobRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    idempotency_key: String,
    payload_reference: String,
    dependency_spec: DependencySpec,
    dependency_hash: DependencyHash,
    resource_limits: Option<ResourceLimits>,
    status: JobStatus,
    #[serde(default)]
    failure: Option<FailureReason>,
    #[serde(default)]
    exit_code: Option<i64>,
    #[serde(default)]
    attempt_count: u32,
    max_attempts: u32,
    #[serde(default)]
    owning_worker: Option<String>,
    #[serde(default)]
    container: Option<ContainerHandle>,
    #[serde(default)]
    cancel_requested: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRecord {
    fn from_job(job: &Job) -> Self {
        Self {
            id: None,
            idempotency_key: job.idempotency_key.clone(),
            payload_reference: job.payload_reference.clone(),
            dependency_spec: job.dependency_spec.clone(),
            dependency_hash: job.dependency_hash.clone(),
            resource_limits: job.resource_limits,
            status: job.status,
            failure: job.failure.clone(),
            exit_code: job.exit_code,
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts,
            owning_worker: job.owning_worker.clone(),
            container: job.container.clone(),
            cancel_requested: job.cancel_requested,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }

    fn into_job(self) -> Result<Job, DbError> {
        let raw = self
            .id
            .as_ref()
            .map(|thing| thing.id.to_raw())
            .ok_or_else(|| DbError::Serialization("job record without id".into()))?;
        let id = JobId::parse(&raw).map_err(|e| DbError::Corrupt {
            table: "job",
            key: raw.clone(),
            message: e.to_string(),
        })?;
        Ok(Job {
            id,
            idempotency_key: self.idempotency_key,
            payload_reference: self.payload_reference,
            dependency_spec: self.dependency_spec,
            dependency_hash: self.dependency_hash,
            resource_limits: self.resource_limits,
            status: self.status,
            failure: self.failure,
            exit_code: self.exit_code,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            owning_worker: self.owning_worker,
            container: self.container,
            cancel_requested: self.cancel_requested,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Result of inserting a job under its idempotency key.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Created(Job),
    /// A job with the same key already existed; nothing was written.
    Existing(Job),
}

impl InsertOutcome {
    pub fn job(&self) -> &Job {
        match self {
            InsertOutcome::Created(job) | InsertOutcome::Existing(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            InsertOutcome::Created(job) | InsertOutcome::Existing(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, InsertOutcome::Created(_))
    }
}

fn statuses(list: &[JobStatus]) -> Vec<String> {
    list.iter().map(|s| s.as_str().to_string()).collect()
}

fn first(records: Vec<JobRecord>) -> Result<Option<Job>, DbError> {
    records.into_iter().next().map(JobRecord::into_job).transpose()
}

impl JobRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a job unless one with the same idempotency key exists.
    pub async fn insert(&self, job: &Job) -> Result<InsertOutcome, DbError> {
        if let Some(existing) = self.find_by_idempotency_key(&job.idempotency_key).await? {
            return Ok(InsertOutcome::Existing(existing));
        }

        let created: Result<Option<JobRecord>, surrealdb::Error> = self
            .db
            .create(("job", job.id.to_string()))
            .content(JobRecord::from_job(job))
            .await;

        match created {
            Ok(Some(record)) => Ok(InsertOutcome::Created(record.into_job()?)),
            Ok(None) => Err(DbError::Query("Failed to create job".into())),
            // Lost a race on the unique index; report the winner.
            Err(err) => match self.find_by_idempotency_key(&job.idempotency_key).await? {
                Some(existing) => Ok(InsertOutcome::Existing(existing)),
                None => Err(err.into()),
            },
        }
    }

    /// Get a job by ID.
    pub async fn get(&self, id: JobId) -> Result<Job, DbError> {
        self.find(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", id)))
    }

    pub async fn find(&self, id: JobId) -> Result<Option<Job>, DbError> {
        let record: Option<JobRecord> = self.db.select(("job", id.to_string())).await?;
        record.map(JobRecord::into_job).transpose()
    }

    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM job WHERE idempotency_key = $key LIMIT 1")
            .bind(("key", key.to_string()))
            .await?;
        let records: Vec<JobRecord> = result.take(0)?;
        first(records)
    }

    /// List jobs in any of `filter`, oldest first.
    pub async fn list_by_status(&self, filter: &[JobStatus]) -> Result<Vec<Job>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM job WHERE status INSIDE $statuses ORDER BY created_at ASC")
            .bind(("statuses", statuses(filter)))
            .await?;
        let records: Vec<JobRecord> = result.take(0)?;
        records.into_iter().map(JobRecord::into_job).collect()
    }

    /// Atomically claim a queued job for `worker`.
    ///
    /// Returns `None` when the job is no longer queued, which is how
    /// duplicate deliveries are detected.
    pub async fn claim(&self, id: JobId, worker: &str) -> Result<Option<Job>, DbError> {
        retry_on_conflict(|| async {
            let mut result = self
                .db
                .query(
                    r#"
                    UPDATE type::thing('job', $id)
                    SET status = 'provisioning',
                        owning_worker = $worker,
                        attempt_count += 1,
                        failure = NONE,
                        exit_code = NONE,
                        updated_at = $now
                    WHERE status = 'queued'
                    RETURN AFTER
                    "#,
                )
                .bind(("id", id.to_string()))
                .bind(("worker", worker.to_string()))
                .bind(("now", Utc::now()))
                .await?;
            let records: Vec<JobRecord> = result.take(0)?;
            first(records)
        })
        .await
    }

    /// Move a job to `to` if it is currently in one of `from`.
    pub async fn transition(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<Option<Job>, DbError> {
        retry_on_conflict(|| async {
            let mut result = self
                .db
                .query(
                    r#"
                    UPDATE type::thing('job', $id)
                    SET status = $to, updated_at = $now
                    WHERE status INSIDE $from
                    RETURN AFTER
                    "#,
                )
                .bind(("id", id.to_string()))
                .bind(("from", statuses(from)))
                .bind(("to", to.as_str().to_string()))
                .bind(("now", Utc::now()))
                .await?;
            let records: Vec<JobRecord> = result.take(0)?;
            first(records)
        })
        .await
    }

    /// `provisioning -> running`, recording the container handle.
    pub async fn mark_running(
        &self,
        id: JobId,
        handle: &ContainerHandle,
    ) -> Result<Option<Job>, DbError> {
        retry_on_conflict(|| async {
            let mut result = self
                .db
                .query(
                    r#"
                    UPDATE type::thing('job', $id)
                    SET status = 'running', container = $container, updated_at = $now
                    WHERE status = 'provisioning'
                    RETURN AFTER
                    "#,
                )
                .bind(("id", id.to_string()))
                .bind(("container", handle.clone()))
                .bind(("now", Utc::now()))
                .await?;
            let records: Vec<JobRecord> = result.take(0)?;
            first(records)
        })
        .await
    }

    /// Record a terminal outcome if the job is still in one of `from`.
    pub async fn finish(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
        failure: Option<FailureReason>,
        exit_code: Option<i64>,
    ) -> Result<Option<Job>, DbError> {
        retry_on_conflict(|| async {
            let mut result = self
                .db
                .query(
                    r#"
                    UPDATE type::thing('job', $id)
                    SET status = $to,
                        failure = $failure,
                        exit_code = $exit_code,
                        updated_at = $now
                    WHERE status INSIDE $from
                    RETURN AFTER
                    "#,
                )
                .bind(("id", id.to_string()))
                .bind(("from", statuses(from)))
                .bind(("to", to.as_str().to_string()))
                .bind(("failure", failure.clone()))
                .bind(("exit_code", exit_code))
                .bind(("now", Utc::now()))
                .await?;
            let records: Vec<JobRecord> = result.take(0)?;
            first(records)
        })
        .await
    }

    /// `failed -> queued` while the attempt budget allows it.
    pub async fn requeue(&self, id: JobId) -> Result<Option<Job>, DbError> {
        retry_on_conflict(|| async {
            let mut result = self
                .db
                .query(
                    r#"
                    UPDATE type::thing('job', $id)
                    SET status = 'queued',
                        owning_worker = NONE,
                        container = NONE,
                        updated_at = $now
                    WHERE status = 'failed'
                        AND attempt_count < max_attempts
                        AND cancel_requested != true
                    RETURN AFTER
                    "#,
                )
                .bind(("id", id.to_string()))
                .bind(("now", Utc::now()))
                .await?;
            let records: Vec<JobRecord> = result.take(0)?;
            first(records)
        })
        .await
    }

    /// Flag an in-flight job for cancellation. `None` once it is no longer
    /// provisioning or running.
    pub async fn request_cancel(&self, id: JobId) -> Result<Option<Job>, DbError> {
        retry_on_conflict(|| async {
            let mut result = self
                .db
                .query(
                    r#"
                    UPDATE type::thing('job', $id)
                    SET cancel_requested = true
                    WHERE status INSIDE ['provisioning', 'running']
                    RETURN AFTER
                    "#,
                )
                .bind(("id", id.to_string()))
                .await?;
            let records: Vec<JobRecord> = result.take(0)?;
            first(records)
        })
        .await
    }

    /// Empty the job's container slot.
    pub async fn clear_container(&self, id: JobId) -> Result<Option<Job>, DbError> {
        retry_on_conflict(|| async {
            let mut result = self
                .db
                .query(
                    "UPDATE type::thing('job', $id) SET container = NONE, updated_at = $now RETURN AFTER",
                )
                .bind(("id", id.to_string()))
                .bind(("now", Utc::now()))
                .await?;
            let records: Vec<JobRecord> = result.take(0)?;
            first(records)
        })
        .await
    }

    /// Empty every container slot. Returns the jobs that had one.
    pub async fn clear_all_containers(&self) -> Result<Vec<Job>, DbError> {
        let mut result = self
            .db
            .query(
                "UPDATE job SET container = NONE, updated_at = $now WHERE container != NONE RETURN BEFORE",
            )
            .bind(("now", Utc::now()))
            .await?;
        let records: Vec<JobRecord> = result.take(0)?;
        records.into_iter().map(JobRecord::into_job).collect()
    }

    /// Count jobs in any of `filter`.
    pub async fn count_by_status(&self, filter: &[JobStatus]) -> Result<u64, DbError> {
        #[derive(Deserialize)]
        struct Count {
            count: i64,
        }

        let mut result = self
            .db
            .query("SELECT count() AS count FROM job WHERE status INSIDE $statuses GROUP ALL")
            .bind(("statuses", statuses(filter)))
            .await?;
        let counts: Vec<Count> = result.take(0)?;
        Ok(counts.first().map(|c| c.count.max(0) as u64).unwrap_or(0))
    }
}
