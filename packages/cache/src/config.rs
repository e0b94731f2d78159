//! Cache configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::CacheError;

/// Settings for the shared package cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache root as seen by this process.
    pub root: PathBuf,
    /// Lifetime written into a lease; holders renew well before it lapses.
    pub lease_ttl: Duration,
    /// Extra slack before an expired lease is considered abandoned.
    pub lease_grace: Duration,
    /// Upper bound on how long `ensure` waits for another holder.
    pub lease_timeout: Duration,
    /// Initial delay between polls while waiting on a lease.
    pub poll_interval: Duration,
    /// Unreferenced entries idle for this long are evicted.
    pub retention: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/packages"),
            lease_ttl: Duration::from_secs(30),
            lease_grace: Duration::from_secs(10),
            lease_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(100),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_lease_grace(mut self, grace: Duration) -> Self {
        self.lease_grace = grace;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Build a config from environment variables.
    ///
    /// - `CACHE_ROOT` (default: `./data/packages`)
    /// - `LEASE_TTL_SECS`, `LEASE_GRACE_SECS`, `LEASE_TIMEOUT_SECS`
    /// - `RETENTION_SECS`
    pub fn from_env() -> Result<Self, CacheError> {
        let mut cfg = Self::default();
        if let Some(root) = std::env::var("CACHE_ROOT").ok().and_then(non_empty) {
            cfg.root = PathBuf::from(root);
        }
        if let Some(ttl) = env_secs("LEASE_TTL_SECS")? {
            cfg.lease_ttl = ttl;
        }
        if let Some(grace) = env_secs("LEASE_GRACE_SECS")? {
            cfg.lease_grace = grace;
        }
        if let Some(timeout) = env_secs("LEASE_TIMEOUT_SECS")? {
            cfg.lease_timeout = timeout;
        }
        if let Some(retention) = env_secs("RETENTION_SECS")? {
            cfg.retention = retention;
        }
        if cfg.lease_ttl.is_zero() {
            return Err(CacheError::InvalidConfig(
                "LEASE_TTL_SECS must be positive".into(),
            ));
        }
        Ok(cfg)
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_secs(var_name: &str) -> Result<Option<Duration>, CacheError> {
    let Some(raw) = std::env::var(var_name).ok().and_then(non_empty) else {
        return Ok(None);
    };
    raw.parse::<u64>()
        .map(|secs| Some(Duration::from_secs(secs)))
        .map_err(|_| CacheError::InvalidConfig(format!("invalid {var_name}={raw} (expected seconds)")))
}
