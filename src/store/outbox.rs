//! Queue between a store and the event bus.
//!
//! Stores enqueue events synchronously while they still hold the per-key lock, so events of one key
//! enter the queue in mutation order. A single [`EventOutbox`] task per store drains the queue in
//! order, which keeps that order on the bus.
use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle};

use crate::{bus::EventBus, config::RetryPolicy, DomainEvent};

/// Create a connected queue/outbox pair.
pub fn event_queue() -> (EventQueue, EventOutbox) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (EventQueue { sender }, EventOutbox { receiver })
}

/// Write side, owned by a store.
#[derive(Debug, Clone)]
pub struct EventQueue {
    sender: mpsc::UnboundedSender<DomainEvent>,
}

impl EventQueue {
    pub(crate) fn enqueue(&self, event: DomainEvent) {
        if let Err(mpsc::error::SendError(event)) = self.sender.send(event) {
            log::warn!(
                target: "featurekit",
                key = event.key.as_str(),
                version = event.version;
                "event outbox is gone, event not published"
            );
        }
    }
}

/// Read side, publishing queued events to a bus.
#[derive(Debug)]
pub struct EventOutbox {
    receiver: mpsc::UnboundedReceiver<DomainEvent>,
}

impl EventOutbox {
    /// Publish queued events one by one until every [`EventQueue`] is dropped. Transient publish
    /// failures are retried until they succeed; other failures drop the event.
    pub async fn run(mut self, bus: Arc<dyn EventBus>, retry: RetryPolicy) {
        while let Some(event) = self.receiver.recv().await {
            let mut attempt = 0;
            loop {
                match bus.publish(event.clone()).await {
                    Ok(()) => break,
                    Err(err) if err.is_transient() => {
                        attempt += 1;
                        log::warn!(
                            target: "featurekit",
                            key = event.key.as_str(),
                            attempt,
                            error:% = err;
                            "failed to publish event, retrying"
                        );
                        tokio::time::sleep(retry.delay(attempt.min(retry.max_attempts))).await;
                    }
                    Err(err) => {
                        log::error!(
                            target: "featurekit",
                            key = event.key.as_str(),
                            version = event.version,
                            error:% = err;
                            "dropping unpublishable event"
                        );
                        break;
                    }
                }
            }
        }
        log::debug!(target: "featurekit", "event outbox closed");
    }

    pub fn spawn(self, bus: Arc<dyn EventBus>, retry: RetryPolicy) -> JoinHandle<()> {
        tokio::spawn(self.run(bus, retry))
    }

    /// Take the next queued event without publishing it.
    pub fn try_next(&mut self) -> Option<DomainEvent> {
        self.receiver.try_recv().ok()
    }
}
