//! Transport over a partitioned log (Kafka-like).
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::{fanout::Fanout, EventBus, EventFilter, Subscription};
use crate::{
    config::BusConfig,
    driver::EventLog,
    sharder::{Md5Sharder, Sharder},
    DomainEvent, Result,
};

const POLL_BATCH: usize = 256;

/// Events are appended to `topic`, partitioned by key so every key keeps its order. One reader
/// task per partition consumes from the end of the log as of startup and feeds local subscribers.
pub struct LogBus {
    event_log: Arc<dyn EventLog>,
    topic: String,
    partitions: u32,
    fanout: Arc<Fanout>,
    readers: Vec<JoinHandle<()>>,
}

impl LogBus {
    pub async fn start(
        event_log: Arc<dyn EventLog>,
        topic: impl Into<String>,
        config: &BusConfig,
    ) -> Result<LogBus> {
        let topic = topic.into();
        let partitions = config.partitions.max(1);
        let fanout = Arc::new(Fanout::new(config.subscriber_buffer));
        let mut readers = Vec::with_capacity(partitions as usize);
        for partition in 0..partitions {
            let offset = event_log.end_offset(&topic, partition).await?;
            readers.push(tokio::spawn(read_partition(
                event_log.clone(),
                topic.clone(),
                partition,
                offset,
                fanout.clone(),
                config.poll_wait,
            )));
        }
        log::debug!(
            target: "featurekit",
            topic = topic.as_str(),
            partitions;
            "started log bus readers"
        );
        Ok(LogBus {
            event_log,
            topic,
            partitions,
            fanout,
            readers,
        })
    }

    fn partition_of(&self, key: &str) -> u32 {
        // The shard is below `partitions`, so it fits.
        Md5Sharder.get_shard(key, u64::from(self.partitions)) as u32
    }
}

async fn read_partition(
    event_log: Arc<dyn EventLog>,
    topic: String,
    partition: u32,
    mut offset: u64,
    fanout: Arc<Fanout>,
    wait: std::time::Duration,
) {
    loop {
        let records = match event_log.poll(&topic, partition, offset, POLL_BATCH, wait).await {
            Ok(records) => records,
            Err(err) => {
                log::warn!(
                    target: "featurekit",
                    topic = topic.as_str(),
                    partition,
                    error:% = err;
                    "failed to poll event log"
                );
                tokio::time::sleep(wait).await;
                continue;
            }
        };
        for record in records {
            offset = record.offset + 1;
            match serde_json::from_slice::<DomainEvent>(&record.payload) {
                Ok(event) => fanout.deliver(&event),
                Err(err) => {
                    log::warn!(
                        target: "featurekit",
                        topic = topic.as_str(),
                        partition,
                        offset = record.offset,
                        error:% = err;
                        "skipping undecodable event"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl EventBus for LogBus {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let payload = serde_json::to_vec(&event)?;
        self.event_log
            .append(&self.topic, self.partition_of(&event.key), payload)
            .await?;
        Ok(())
    }

    fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.fanout.subscribe(filter)
    }
}

impl Drop for LogBus {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
        self.fanout.close();
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::{bus::tests::event, driver::MemoryEventLog};

    fn config() -> BusConfig {
        BusConfig {
            subscriber_buffer: 64,
            partitions: 4,
            poll_wait: std::time::Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn keeps_per_key_order_across_partitions() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new());
        let bus = LogBus::start(log, "events", &config()).await.unwrap();
        let mut subscription = bus.subscribe(EventFilter::all());

        for version in 1..=5 {
            for key in ["flags/a", "flags/b", "flags/c"] {
                bus.publish(event(key, version)).await.unwrap();
            }
        }

        let mut last = std::collections::HashMap::new();
        for _ in 0..15 {
            let event = subscription.next().await.unwrap().unwrap();
            let previous = last.insert(event.key.clone(), event.version).unwrap_or(0);
            assert!(event.version > previous);
        }
    }

    #[tokio::test]
    async fn instances_sharing_a_log_see_each_other() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new());
        let first = LogBus::start(log.clone(), "events", &config()).await.unwrap();
        let second = LogBus::start(log, "events", &config()).await.unwrap();
        let mut subscription = second.subscribe(EventFilter::all());

        first.publish(event("flags/a", 1)).await.unwrap();
        assert_eq!(subscription.next().await.unwrap().unwrap().key, "flags/a");
    }
}
