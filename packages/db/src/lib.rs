//! SurrealDB integration for the sibling container orchestrator.
//!
//! This crate provides database connectivity and repositories for
//! persisting jobs, the package index and artifact records.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod schema;
pub mod repositories;

pub use connection::{Database, DbConfig, DbError, connect, retry_on_conflict};
pub use schema::init_schema;

/// Connect and initialise the schema.
pub async fn init(config: &DbConfig) -> Result<Database, DbError> {
    let db = connect(config).await?;
    init_schema(&db).await?;
    Ok(db)
}
