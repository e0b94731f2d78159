//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// This creates all necessary tables and indexes.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(JOB_SCHEMA).await?.check()?;
    db.query(PACKAGE_SCHEMA).await?.check()?;
    db.query(ARTIFACT_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job table schema. Timestamps are written by the application.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMALESS;

-- Submitting twice with one key must never yield two jobs
DEFINE INDEX IF NOT EXISTS job_idempotency ON job FIELDS idempotency_key UNIQUE;
DEFINE INDEX IF NOT EXISTS job_status ON job FIELDS status;
DEFINE INDEX IF NOT EXISTS job_dependency ON job FIELDS dependency_hash;
"#;

/// Package index schema, keyed by dependency hash.
const PACKAGE_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS package SCHEMALESS;

DEFINE INDEX IF NOT EXISTS package_state ON package FIELDS state;
"#;

/// Artifact table schema.
const ARTIFACT_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS artifact SCHEMALESS;

DEFINE INDEX IF NOT EXISTS artifact_job ON artifact FIELDS job_id;
DEFINE INDEX IF NOT EXISTS artifact_job_path ON artifact FIELDS job_id, path UNIQUE;
"#;
