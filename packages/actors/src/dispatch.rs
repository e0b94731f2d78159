//! Lazy, restartable stream of deliveries.
//!
//! A pump task asks the coordinator for a message only once the bounded
//! channel has room, so nothing is taken off the queue before a consumer
//! can accept it. Dropping the stream stops the pump; deliveries it had
//! already taken stay in flight at the coordinator and come back after the
//! visibility window.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use orchestrator_core::Delivery;
use ractor::ActorRef;
use ractor::rpc::CallResult;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::messages::CoordinatorMessage;

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Stream of deliveries pulled from a coordinator.
pub struct Dispatch {
    rx: mpsc::Receiver<Delivery>,
    pump: JoinHandle<()>,
}

/// Start pulling from `coordinator` into a channel of `capacity`.
pub fn dispatch(
    coordinator: ActorRef<CoordinatorMessage>,
    capacity: usize,
    poll_interval: Duration,
) -> Dispatch {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let pump = tokio::spawn(async move {
        loop {
            // Wait for room before taking anything off the queue
            let Ok(permit) = tx.reserve().await else {
                break;
            };
            let result = ractor::rpc::call(
                &coordinator,
                |reply| CoordinatorMessage::Dequeue { reply },
                Some(CALL_TIMEOUT),
            )
            .await;
            match result {
                Ok(CallResult::Success(Some(delivery))) => permit.send(delivery),
                Ok(CallResult::Success(None)) | Ok(CallResult::Timeout) => {
                    drop(permit);
                    tokio::time::sleep(poll_interval).await;
                }
                Ok(CallResult::SenderError) | Err(_) => {
                    tracing::debug!("Coordinator gone; stopping dispatch pump");
                    break;
                }
            }
        }
    });
    Dispatch { rx, pump }
}

impl Stream for Dispatch {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Dispatch {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
