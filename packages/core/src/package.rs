//! Package cache domain types.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::JobId;

/// Normalized list of dependency requirements.
///
/// Lines are trimmed, blank lines and `#` comments dropped, duplicates
/// removed and the remainder sorted, so two specs that differ only in
/// ordering or whitespace hash identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencySpec(Vec<String>);

impl DependencySpec {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set: BTreeSet<String> = lines
            .into_iter()
            .map(|line| line.as_ref().trim().to_string())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect();
        Self(set.into_iter().collect())
    }

    pub fn lines(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable content hash of the normalized spec.
    pub fn hash(&self) -> DependencyHash {
        let mut hasher = Sha256::new();
        for line in &self.0 {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        DependencyHash(hex::encode(hasher.finalize()))
    }
}

/// Content address of a dependency set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencyHash(pub String);

impl DependencyHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hashes double as directory and record names, so only accept
    /// lowercase hex and ascii alphanumerics.
    pub fn is_well_formed(s: &str) -> bool {
        !s.is_empty() && s.len() <= 128 && s.bytes().all(|b| b.is_ascii_alphanumeric())
    }
}

impl From<&str> for DependencyHash {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for DependencyHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Installation state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    Pending,
    Ready,
    Failed,
}

impl PackageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageState::Pending => "pending",
            PackageState::Ready => "ready",
            PackageState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PackageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index row for one installed (or installing) dependency set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageEntry {
    pub dependency_hash: DependencyHash,
    pub install_path: PathBuf,
    pub dependencies: DependencySpec,
    pub state: PackageState,
    /// Jobs currently referencing this entry.
    #[serde(default)]
    pub holders: Vec<JobId>,
    /// Installer error, when `state` is failed.
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl PackageEntry {
    pub fn pending(hash: DependencyHash, install_path: PathBuf, dependencies: DependencySpec) -> Self {
        let now = Utc::now();
        Self {
            dependency_hash: hash,
            install_path,
            dependencies,
            state: PackageState::Pending,
            holders: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
            last_used_at: now,
        }
    }

    pub fn ref_count(&self) -> usize {
        self.holders.len()
    }

    /// Unreferenced, settled and idle for at least `retention`.
    pub fn is_eviction_eligible(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        if self.ref_count() != 0 || self.state == PackageState::Pending {
            return false;
        }
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        self.last_used_at
            .checked_add_signed(retention)
            .is_some_and(|deadline| deadline <= now)
    }
}
