//! Artifacts produced by completed jobs.

use serde::{Deserialize, Serialize};

use crate::JobId;

/// A file left in a job's artifact directory. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub job_id: JobId,
    /// Path relative to the job's artifact directory.
    pub path: String,
    /// Hex sha256 of the contents.
    pub checksum: String,
    pub size: u64,
}
