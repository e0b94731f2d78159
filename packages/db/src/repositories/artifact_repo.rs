//! Artifact record repository.

use orchestrator_core::{ArtifactRecord, JobId};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::{Database, DbError};

/// Repository for artifact records. Records are write-once.
#[derive(Clone)]
pub struct ArtifactRepository {
    db: Database,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArtifactRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    #[serde(flatten)]
    record: ArtifactRecord,
}

impl ArtifactRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store `record` unless `(job_id, path)` is already recorded.
    ///
    /// Returns `false` when an earlier record was kept.
    pub async fn record(&self, record: &ArtifactRecord) -> Result<bool, DbError> {
        if self.find(record.job_id, &record.path).await?.is_some() {
            return Ok(false);
        }

        let created: Result<Option<ArtifactRow>, surrealdb::Error> = self
            .db
            .create("artifact")
            .content(ArtifactRow {
                id: None,
                record: record.clone(),
            })
            .await;

        match created {
            Ok(_) => Ok(true),
            // Unique (job_id, path) index rejected a concurrent duplicate
            Err(err) => match self.find(record.job_id, &record.path).await? {
                Some(_) => Ok(false),
                None => Err(err.into()),
            },
        }
    }

    pub async fn find(&self, job_id: JobId, path: &str) -> Result<Option<ArtifactRecord>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM artifact WHERE job_id = $job_id AND path = $path LIMIT 1")
            .bind(("job_id", job_id.to_string()))
            .bind(("path", path.to_string()))
            .await?;
        let rows: Vec<ArtifactRow> = result.take(0)?;
        Ok(rows.into_iter().next().map(|row| row.record))
    }

    /// All artifacts of a job, ordered by path.
    pub async fn list_for_job(&self, job_id: JobId) -> Result<Vec<ArtifactRecord>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM artifact WHERE job_id = $job_id ORDER BY path ASC")
            .bind(("job_id", job_id.to_string()))
            .await?;
        let rows: Vec<ArtifactRow> = result.take(0)?;
        Ok(rows.into_iter().map(|row| row.record).collect())
    }
}
