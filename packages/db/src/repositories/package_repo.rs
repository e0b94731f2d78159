//! Package index repository.
//!
//! Rows are decoded through `serde_json` so a malformed row surfaces as
//! [`DbError::Corrupt`] instead of a generic driver error.

use chrono::Utc;
use orchestrator_core::{DependencyHash, JobId, PackageEntry};
use serde::Deserialize;
use serde_json::{Map, Value};
use surrealdb::sql::Thing;

use crate::{Database, DbError, retry_on_conflict};

/// Repository for package index rows, keyed by dependency hash.
#[derive(Clone)]
pub struct PackageRepository {
    db: Database,
}

/// Raw row; the record id is split off so the rest decodes as plain JSON.
#[derive(Debug, Deserialize)]
struct PackageRecord {
    #[serde(default)]
    id: Option<Thing>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

fn decode(row: PackageRecord) -> Result<PackageEntry, DbError> {
    let key = row
        .id
        .as_ref()
        .map(|thing| thing.id.to_raw())
        .unwrap_or_else(|| "<unknown>".to_string());
    serde_json::from_value(Value::Object(row.fields)).map_err(|e| DbError::Corrupt {
        table: "package",
        key,
        message: e.to_string(),
    })
}

fn decode_first(rows: Vec<PackageRecord>) -> Result<Option<PackageEntry>, DbError> {
    rows.into_iter().next().map(decode).transpose()
}

fn holder_ids(holders: &[JobId]) -> Vec<String> {
    holders.iter().map(ToString::to_string).collect()
}

impl PackageRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, hash: &DependencyHash) -> Result<Option<PackageEntry>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM type::thing('package', $hash)")
            .bind(("hash", hash.to_string()))
            .await?;
        let rows: Vec<PackageRecord> = result.take(0)?;
        decode_first(rows)
    }

    /// All rows. Fails with [`DbError::Corrupt`] if any row is malformed.
    pub async fn list(&self) -> Result<Vec<PackageEntry>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM package ORDER BY created_at ASC")
            .await?;
        let rows: Vec<PackageRecord> = result.take(0)?;
        rows.into_iter().map(decode).collect()
    }

    /// Write `entry` as-is, replacing any existing row.
    pub async fn upsert(&self, entry: &PackageEntry) -> Result<PackageEntry, DbError> {
        let content = serde_json::to_value(entry)?;
        retry_on_conflict(|| async {
            let mut result = self
                .db
                .query("UPSERT type::thing('package', $hash) CONTENT $entry RETURN AFTER")
                .bind(("hash", entry.dependency_hash.to_string()))
                .bind(("entry", content.clone()))
                .await?;
            let rows: Vec<PackageRecord> = result.take(0)?;
            decode_first(rows)?.ok_or_else(|| DbError::Query("Failed to upsert package".into()))
        })
        .await
    }

    /// `pending -> ready`.
    pub async fn mark_ready(&self, hash: &DependencyHash) -> Result<Option<PackageEntry>, DbError> {
        self.update_where(
            hash,
            "SET state = 'ready', error = NONE, updated_at = $now, last_used_at = $now WHERE state = 'pending'",
            None,
        )
        .await
    }

    /// `pending -> failed` with the installer error.
    pub async fn mark_failed(
        &self,
        hash: &DependencyHash,
        error: &str,
    ) -> Result<Option<PackageEntry>, DbError> {
        self.update_where(
            hash,
            "SET state = 'failed', error = $arg, updated_at = $now WHERE state = 'pending'",
            Some(Value::String(error.to_string())),
        )
        .await
    }

    /// Add `job` to the holder set of a ready entry. Idempotent per job.
    pub async fn add_holder(
        &self,
        hash: &DependencyHash,
        job: JobId,
    ) -> Result<Option<PackageEntry>, DbError> {
        self.update_where(
            hash,
            "SET holders = array::union(holders ?? [], [$arg]), last_used_at = $now WHERE state = 'ready'",
            Some(Value::String(job.to_string())),
        )
        .await
    }

    /// Remove `job` from the holder set. `None` if it was not a holder.
    pub async fn release(
        &self,
        hash: &DependencyHash,
        job: JobId,
    ) -> Result<Option<PackageEntry>, DbError> {
        self.update_where(
            hash,
            "SET holders = array::complement(holders, [$arg]), last_used_at = $now WHERE holders CONTAINS $arg",
            Some(Value::String(job.to_string())),
        )
        .await
    }

    /// Replace the holder set wholesale.
    pub async fn set_holders(
        &self,
        hash: &DependencyHash,
        holders: &[JobId],
    ) -> Result<Option<PackageEntry>, DbError> {
        self.update_where(
            hash,
            "SET holders = $arg",
            Some(serde_json::to_value(holder_ids(holders))?),
        )
        .await
    }

    /// Delete the row only if nothing holds it and it is not mid-install.
    pub async fn delete_if_unreferenced(
        &self,
        hash: &DependencyHash,
    ) -> Result<Option<PackageEntry>, DbError> {
        retry_on_conflict(|| async {
            let mut result = self
                .db
                .query(
                    r#"
                    DELETE type::thing('package', $hash)
                    WHERE array::len(holders ?? []) = 0 AND state != 'pending'
                    RETURN BEFORE
                    "#,
                )
                .bind(("hash", hash.to_string()))
                .await?;
            let rows: Vec<PackageRecord> = result.take(0)?;
            decode_first(rows)
        })
        .await
    }

    pub async fn delete(&self, hash: &DependencyHash) -> Result<(), DbError> {
        retry_on_conflict(|| async {
            self.db
                .query("DELETE type::thing('package', $hash)")
                .bind(("hash", hash.to_string()))
                .await?
                .check()?;
            Ok(())
        })
        .await
    }

    pub async fn delete_all(&self) -> Result<(), DbError> {
        self.db.query("DELETE package").await?.check()?;
        Ok(())
    }

    async fn update_where(
        &self,
        hash: &DependencyHash,
        clause: &str,
        arg: Option<Value>,
    ) -> Result<Option<PackageEntry>, DbError> {
        let query = format!(
            "UPDATE type::thing('package', $hash) {} RETURN AFTER",
            clause
        );
        retry_on_conflict(|| async {
            let mut result = self
                .db
                .query(query.as_str())
                .bind(("hash", hash.to_string()))
                .bind(("arg", arg.clone().unwrap_or(Value::Null)))
                .bind(("now", Utc::now()))
                .await?;
            let rows: Vec<PackageRecord> = result.take(0)?;
            decode_first(rows)
        })
        .await
    }
}
