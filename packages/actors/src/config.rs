//! Orchestrator tuning knobs.

use std::time::Duration;

use crate::messages::ActorError;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Identifies this process in `owning_worker`.
    pub instance_id: String,
    /// Number of worker actors.
    pub worker_concurrency: usize,
    /// Attempt budget given to new jobs.
    pub max_attempts: u32,
    /// A delivery not acknowledged within this window is redelivered.
    pub visibility_timeout: Duration,
    /// First retry delay; doubles per attempt.
    pub retry_base: Duration,
    /// Upper bound on the retry delay.
    pub retry_max: Duration,
    /// How long the dispatch pump waits when nothing is visible.
    pub dispatch_poll: Duration,
    /// Coordinator housekeeping period.
    pub tick_interval: Duration,
    pub reconcile_interval: Duration,
    pub gc_interval: Duration,
    /// A `provisioning` job untouched for this long without a container is
    /// considered abandoned.
    pub stale_provisioning: Duration,
    /// Bound on waiting for in-flight jobs during a flush.
    pub drain_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            instance_id: ulid::Ulid::new().to_string().to_lowercase(),
            worker_concurrency: 4,
            max_attempts: 3,
            visibility_timeout: Duration::from_secs(60),
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(60),
            dispatch_poll: Duration::from_millis(250),
            tick_interval: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(30),
            gc_interval: Duration::from_secs(300),
            stale_provisioning: Duration::from_secs(15 * 60),
            drain_timeout: Duration::from_secs(60),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_worker_concurrency(mut self, workers: usize) -> Self {
        self.worker_concurrency = workers.max(1);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base = base;
        self.retry_max = max.max(base);
        self
    }

    pub fn with_dispatch_poll(mut self, poll: Duration) -> Self {
        self.dispatch_poll = poll;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn with_stale_provisioning(mut self, threshold: Duration) -> Self {
        self.stale_provisioning = threshold;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Delay before attempt `attempt + 1`, given that `attempt` failed.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.retry_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.retry_max)
            .min(self.retry_max)
    }

    /// Build a config from environment variables.
    ///
    /// - `WORKER_CONCURRENCY` (default: 4)
    /// - `MAX_ATTEMPTS` (default: 3)
    /// - `VISIBILITY_TIMEOUT_SECS` (default: 60)
    /// - `RECONCILE_INTERVAL_SECS` (default: 30)
    /// - `GC_INTERVAL_SECS` (default: 300)
    /// - `STALE_PROVISIONING_SECS` (default: 900)
    pub fn from_env() -> Result<Self, ActorError> {
        let mut config = Self::default();
        if let Some(n) = env_number("WORKER_CONCURRENCY")? {
            config.worker_concurrency = positive("WORKER_CONCURRENCY", n)? as usize;
        }
        if let Some(n) = env_number("MAX_ATTEMPTS")? {
            config.max_attempts = positive("MAX_ATTEMPTS", n)? as u32;
        }
        if let Some(n) = env_number("VISIBILITY_TIMEOUT_SECS")? {
            config.visibility_timeout = Duration::from_secs(positive("VISIBILITY_TIMEOUT_SECS", n)?);
        }
        if let Some(n) = env_number("RECONCILE_INTERVAL_SECS")? {
            config.reconcile_interval = Duration::from_secs(positive("RECONCILE_INTERVAL_SECS", n)?);
        }
        if let Some(n) = env_number("GC_INTERVAL_SECS")? {
            config.gc_interval = Duration::from_secs(positive("GC_INTERVAL_SECS", n)?);
        }
        if let Some(n) = env_number("STALE_PROVISIONING_SECS")? {
            config.stale_provisioning = Duration::from_secs(positive("STALE_PROVISIONING_SECS", n)?);
        }
        Ok(config)
    }
}

fn env_number(key: &str) -> Result<Option<u64>, ActorError> {
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ActorError::InvalidConfig(format!("{key}={raw:?} is not a number"))),
        Err(_) => Ok(None),
    }
}

fn positive(key: &str, value: u64) -> Result<u64, ActorError> {
    if value == 0 {
        return Err(ActorError::InvalidConfig(format!("{key} must be positive")));
    }
    Ok(value)
}
