//! Coordinator actor: intake, visibility-window redelivery and retry.
//!
//! The coordinator owns the in-memory message queue. Persisted job rows are
//! the source of truth; on start every `queued` job gets a fresh message, so
//! the queue itself never needs to be saved.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use db::repositories::JobRepository;
use orchestrator_core::{
    Delivery, DeliveryId, Job, JobId, JobStatus, JobSubmission, OrchestratorEvent, QueueMessage,
};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use runtime::LifecycleManager;
use tokio::sync::broadcast;

use crate::config::OrchestratorConfig;
use crate::messages::{CoordinatorMessage, CoordinatorStats};

/// A queued message ordered by when it becomes visible (earliest first),
/// then by arrival.
#[derive(Debug, Clone)]
struct PendingMessage {
    visible_at: DateTime<Utc>,
    seq: u64,
    message: QueueMessage,
}

impl PartialEq for PendingMessage {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for PendingMessage {}

impl PartialOrd for PendingMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest pops first
        other
            .visible_at
            .cmp(&self.visible_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct InFlight {
    delivery: Delivery,
    deadline: DateTime<Utc>,
}

/// State for the coordinator actor.
pub struct CoordinatorState {
    config: OrchestratorConfig,
    jobs: JobRepository,
    lifecycle: Arc<LifecycleManager>,
    pending: BinaryHeap<PendingMessage>,
    in_flight: HashMap<DeliveryId, InFlight>,
    quiesced: bool,
    seq: u64,
    event_tx: Option<broadcast::Sender<OrchestratorEvent>>,
}

impl CoordinatorState {
    fn broadcast(&self, event: OrchestratorEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn push(&mut self, message: QueueMessage, visible_at: DateTime<Utc>) {
        self.seq += 1;
        self.pending.push(PendingMessage {
            visible_at,
            seq: self.seq,
            message,
        });
    }

    fn pop_visible(&mut self, now: DateTime<Utc>) -> Option<QueueMessage> {
        if self.pending.peek()?.visible_at > now {
            return None;
        }
        self.pending.pop().map(|p| p.message)
    }

    fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            pending: self.pending.len(),
            in_flight: self.in_flight.len(),
            quiesced: self.quiesced,
        }
    }

    fn visibility(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.visibility_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    async fn enqueue(&mut self, submission: JobSubmission) -> Result<JobId, String> {
        submission
            .validate()
            .map_err(|e| format!("invalid submission: {}", e))?;

        let job = Job::from_submission(submission).with_max_attempts(self.config.max_attempts);
        let outcome = self
            .jobs
            .insert(&job)
            .await
            .map_err(|e| format!("Failed to persist job: {}", e))?;

        let job = outcome.job();
        if outcome.is_created() {
            self.push(job.message(), Utc::now());
            tracing::info!(job_id = %job.id, payload = %job.payload_reference, "Job enqueued");
            self.broadcast(OrchestratorEvent::JobEnqueued {
                job_id: job.id,
                payload_reference: job.payload_reference.clone(),
                timestamp: Utc::now(),
            });
        } else {
            tracing::debug!(job_id = %job.id, key = %job.idempotency_key, "Duplicate submission");
        }
        Ok(job.id)
    }

    async fn retry(&mut self, job_id: JobId) {
        match self.jobs.requeue(job_id).await {
            Ok(Some(job)) => {
                let delay = self.config.retry_delay(job.attempt_count);
                let visible_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                self.push(job.message(), visible_at);

                tracing::info!(
                    job_id = %job_id,
                    attempt = job.attempt_count + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying job"
                );
                self.broadcast(OrchestratorEvent::JobStatusChanged {
                    job_id,
                    old_status: JobStatus::Failed,
                    new_status: JobStatus::Queued,
                    failure: None,
                    timestamp: Utc::now(),
                });
                self.broadcast(OrchestratorEvent::JobRetrying {
                    job_id,
                    attempt: job.attempt_count + 1,
                    delay_ms: delay.as_millis() as u64,
                    timestamp: Utc::now(),
                });
            }
            Ok(None) => {
                tracing::info!(job_id = %job_id, "Job not re-queued; attempt budget spent");
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to re-queue job");
            }
        }
    }

    async fn restore(&mut self) {
        match self.jobs.list_by_status(&[JobStatus::Queued]).await {
            Ok(queued) => {
                let now = Utc::now();
                for job in &queued {
                    self.push(job.message(), now);
                }
                if !queued.is_empty() {
                    tracing::info!(count = queued.len(), "Restored queued jobs");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to restore queued jobs"),
        }
    }

    fn redeliver_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<DeliveryId> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(flight) = self.in_flight.remove(&id) {
                tracing::debug!(
                    job_id = %flight.delivery.job_id(),
                    delivery_id = %id,
                    "Delivery not acknowledged; redelivering"
                );
                self.push(flight.delivery.message, now);
            }
        }
    }
}

/// Arguments for the coordinator actor.
pub struct CoordinatorArgs {
    pub config: OrchestratorConfig,
    pub jobs: JobRepository,
    pub lifecycle: Arc<LifecycleManager>,
    pub event_tx: Option<broadcast::Sender<OrchestratorEvent>>,
}

/// Coordinator actor that owns the message queue.
pub struct CoordinatorActor;

impl Actor for CoordinatorActor {
    type Msg = CoordinatorMessage;
    type State = CoordinatorState;
    type Arguments = CoordinatorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting coordinator");

        let mut state = CoordinatorState {
            config: args.config,
            jobs: args.jobs,
            lifecycle: args.lifecycle,
            pending: BinaryHeap::new(),
            in_flight: HashMap::new(),
            quiesced: false,
            seq: 0,
            event_tx: args.event_tx,
        };
        state.restore().await;

        // Start periodic tick
        let tick = state.config.tick_interval;
        let myself_clone = myself.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                if myself_clone.send_message(CoordinatorMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(state)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            CoordinatorMessage::Enqueue { submission, reply } => {
                let result = state.enqueue(*submission).await;
                let _ = reply.send(result);
            }

            CoordinatorMessage::Dequeue { reply } => {
                if state.quiesced {
                    let _ = reply.send(None);
                    return Ok(());
                }
                let now = Utc::now();
                let Some(message) = state.pop_visible(now) else {
                    let _ = reply.send(None);
                    return Ok(());
                };
                let delivery = Delivery::new(message);
                let deadline = now + state.visibility();
                state.in_flight.insert(
                    delivery.delivery_id,
                    InFlight {
                        delivery: delivery.clone(),
                        deadline,
                    },
                );
                let _ = reply.send(Some(delivery));
            }

            CoordinatorMessage::Ack { delivery_id } => {
                state.in_flight.remove(&delivery_id);
            }

            CoordinatorMessage::Nack { delivery_id } => {
                if let Some(flight) = state.in_flight.remove(&delivery_id) {
                    state.push(flight.delivery.message, Utc::now());
                }
            }

            CoordinatorMessage::Retry { job_id } => {
                state.retry(job_id).await;
            }

            CoordinatorMessage::Cancel { job_id, reply } => {
                let before = state.pending.len();
                state.pending.retain(|p| p.message.job_id != job_id);
                if state.pending.len() != before {
                    tracing::debug!(job_id = %job_id, "Dropped pending messages for canceled job");
                }
                let result = state
                    .lifecycle
                    .cancel(job_id)
                    .await
                    .map_err(|e| format!("Failed to cancel job: {}", e));
                let _ = reply.send(result);
            }

            CoordinatorMessage::Quiesce => {
                tracing::info!("Coordinator quiesced");
                state.quiesced = true;
            }

            CoordinatorMessage::Resume => {
                tracing::info!("Coordinator resumed");
                state.quiesced = false;
            }

            CoordinatorMessage::GetStats { reply } => {
                let _ = reply.send(state.stats());
            }

            CoordinatorMessage::Tick => {
                state.redeliver_expired(Utc::now());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::DependencyHash;

    fn message() -> QueueMessage {
        QueueMessage {
            job_id: JobId::new(),
            attempt: 1,
            payload_reference: "agent:1".into(),
            dependency_hash: DependencyHash::from("abc"),
        }
    }

    #[test]
    fn earliest_visible_message_pops_first() {
        let now = Utc::now();
        let mut heap = BinaryHeap::new();
        let late = message();
        let early = message();
        let also_early = message();
        heap.push(PendingMessage {
            visible_at: now + chrono::Duration::seconds(5),
            seq: 1,
            message: late.clone(),
        });
        heap.push(PendingMessage {
            visible_at: now,
            seq: 2,
            message: early.clone(),
        });
        heap.push(PendingMessage {
            visible_at: now,
            seq: 3,
            message: also_early.clone(),
        });

        let order: Vec<JobId> =
            std::iter::from_fn(|| heap.pop().map(|p| p.message.job_id)).collect();
        assert_eq!(order, [early.job_id, also_early.job_id, late.job_id]);
    }
}
