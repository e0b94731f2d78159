//! Broker messages exchanged between the coordinator and workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{DependencyHash, JobId};

/// The body of one queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub job_id: JobId,
    /// 1-based attempt this message was published for.
    pub attempt: u32,
    pub payload_reference: String,
    pub dependency_hash: DependencyHash,
}

/// Identifies one delivery of a message; redeliveries get a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub Ulid);

impl DeliveryId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to a consumer, pending acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub delivery_id: DeliveryId,
    pub message: QueueMessage,
    pub delivered_at: DateTime<Utc>,
}

impl Delivery {
    pub fn new(message: QueueMessage) -> Self {
        Self {
            delivery_id: DeliveryId::new(),
            message,
            delivered_at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.message.job_id
    }
}
