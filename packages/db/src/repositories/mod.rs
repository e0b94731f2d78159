//! Repository implementations for database operations.

mod artifact_repo;
mod job_repo;
mod package_repo;

pub use artifact_repo::ArtifactRepository;
pub use job_repo::{InsertOutcome, JobRepository};
pub use package_repo::PackageRepository;
