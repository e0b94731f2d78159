use db::{Database, DbConfig, DbError};
use orchestrator_core::{Job, JobSubmission, ResourceLimits};

/// Fresh in-memory database with the schema applied.
pub async fn setup_db() -> Result<Database, DbError> {
    db::init(&DbConfig::memory()).await
}

pub fn job(key: &str) -> Job {
    Job::from_submission(
        JobSubmission::new(key, "agent:echo")
            .with_dependencies(["requests==2.31"])
            .with_limits(ResourceLimits::new(1.0, 256, 60)),
    )
}
