//! Transport over a pub/sub broker (Redis pub/sub, distributed pub/sub).
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;

use super::{fanout::Fanout, EventBus, EventFilter, Subscription};
use crate::{driver::PubSubBroker, DomainEvent, Result};

/// Events are published as JSON on one broker channel. Every instance, including the publisher,
/// receives them through its channel subscription, which feeds local subscribers. Brokers only
/// guarantee per-publisher order, which is enough for per-key order as every key has a single
/// writing store.
pub struct PubSubBus {
    broker: Arc<dyn PubSubBroker>,
    channel: String,
    fanout: Arc<Fanout>,
    reader: JoinHandle<()>,
}

impl PubSubBus {
    pub async fn start(
        broker: Arc<dyn PubSubBroker>,
        channel: impl Into<String>,
        subscriber_buffer: usize,
    ) -> Result<PubSubBus> {
        let channel = channel.into();
        let fanout = Arc::new(Fanout::new(subscriber_buffer));
        let mut messages = broker.subscribe(&channel).await?;
        let reader = {
            let fanout = fanout.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                while let Some(payload) = messages.next().await {
                    match serde_json::from_slice::<DomainEvent>(&payload) {
                        Ok(event) => fanout.deliver(&event),
                        Err(err) => {
                            log::warn!(
                                target: "featurekit",
                                channel = channel.as_str(),
                                error:% = err;
                                "skipping undecodable event"
                            );
                        }
                    }
                }
                log::debug!(
                    target: "featurekit",
                    channel = channel.as_str();
                    "broker subscription ended"
                );
                fanout.close();
            })
        };
        Ok(PubSubBus {
            broker,
            channel,
            fanout,
            reader,
        })
    }
}

#[async_trait]
impl EventBus for PubSubBus {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let payload = serde_json::to_vec(&event)?;
        self.broker.publish(&self.channel, payload).await
    }

    fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.fanout.subscribe(filter)
    }
}

impl Drop for PubSubBus {
    fn drop(&mut self) {
        self.reader.abort();
        self.fanout.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bus::tests::event, driver::MemoryBroker, EntityKind};

    #[tokio::test]
    async fn fans_out_across_instances() {
        let broker: Arc<dyn PubSubBroker> = Arc::new(MemoryBroker::new());
        let first = PubSubBus::start(broker.clone(), "test:events", 16).await.unwrap();
        let second = PubSubBus::start(broker, "test:events", 16).await.unwrap();
        let mut own = first.subscribe(EventFilter::kinds([EntityKind::Flags]));
        let mut remote = second.subscribe(EventFilter::all());

        first.publish(event("flags/a", 1)).await.unwrap();
        first.publish(event("flags/a", 2)).await.unwrap();

        assert_eq!(own.next().await.unwrap().unwrap().version, 1);
        assert_eq!(own.next().await.unwrap().unwrap().version, 2);
        assert_eq!(remote.next().await.unwrap().unwrap().version, 1);
    }
}
