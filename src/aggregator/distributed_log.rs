use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ExperimentResults, VariantEvent, VariantEventAggregator};
use crate::{
    config::AggregatorEngine,
    driver::EventLog,
    sharder::{Md5Sharder, Sharder},
    Result,
};

/// Records fetched per poll while catching up.
const BATCH_SIZE: usize = 512;

/// Kafka-like: events are appended to a topic partitioned by experiment id, and results are a
/// fold over the partition, caught up on every read. Redelivered events are appended again and
/// skipped by the fold.
pub struct LogAggregator {
    log: Arc<dyn EventLog>,
    topic: String,
    partitions: u32,
    folds: Mutex<HashMap<u32, PartitionFold>>,
}

#[derive(Default)]
struct PartitionFold {
    next_offset: u64,
    seen: HashSet<String>,
    experiments: HashMap<String, ExperimentResults>,
}

impl PartitionFold {
    fn apply(&mut self, event: VariantEvent) {
        if !self.seen.insert(event.id) {
            return;
        }
        self.experiments
            .entry(event.experiment_id.clone())
            .or_insert_with(|| ExperimentResults::new(event.experiment_id))
            .add(&event.variant_id, event.kind, 1);
    }
}

impl LogAggregator {
    pub fn new(log: Arc<dyn EventLog>, topic: impl Into<String>, partitions: u32) -> LogAggregator {
        LogAggregator {
            log,
            topic: topic.into(),
            partitions: partitions.max(1),
            folds: Mutex::new(HashMap::new()),
        }
    }

    fn partition_of(&self, experiment_id: &str) -> u32 {
        // `partitions` fits in u32, so does the shard.
        Md5Sharder.get_shard(experiment_id, u64::from(self.partitions)) as u32
    }
}

#[async_trait]
impl VariantEventAggregator for LogAggregator {
    fn engine(&self) -> AggregatorEngine {
        AggregatorEngine::DistributedLog
    }

    async fn record(&self, event: &VariantEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.log
            .append(&self.topic, self.partition_of(&event.experiment_id), payload)
            .await?;
        Ok(())
    }

    async fn aggregate(&self, experiment_id: &str) -> Result<ExperimentResults> {
        let partition = self.partition_of(experiment_id);
        let end = self.log.end_offset(&self.topic, partition).await?;
        let mut folds = self.folds.lock().await;
        let fold = folds.entry(partition).or_default();
        while fold.next_offset < end {
            let records = self
                .log
                .poll(&self.topic, partition, fold.next_offset, BATCH_SIZE, Duration::ZERO)
                .await?;
            if records.is_empty() {
                break;
            }
            for record in records {
                fold.next_offset = record.offset + 1;
                match serde_json::from_slice::<VariantEvent>(&record.payload) {
                    Ok(event) => fold.apply(event),
                    Err(err) => {
                        log::warn!(
                            target: "featurekit",
                            topic = self.topic.as_str(),
                            partition,
                            offset = record.offset,
                            error:% = err;
                            "skipping undecodable variant event"
                        );
                    }
                }
            }
        }
        Ok(fold
            .experiments
            .get(experiment_id)
            .cloned()
            .unwrap_or_else(|| ExperimentResults::new(experiment_id)))
    }
}
