use async_trait::async_trait;
use sled::{
    transaction::{ConflictableTransactionError, TransactionError},
    Transactional,
};

use super::{ExperimentResults, VariantEvent, VariantEventAggregator, VariantEventKind};
use crate::{config::AggregatorEngine, Engine, Error, Result};

/// LevelDB-like counters in two local `sled` trees: `{namespace}/variant-events` holds the ids of
/// counted events and `{namespace}/variant-counts` big-endian counters keyed by
/// `experiment \0 variant \0 kind`. Claiming the id and incrementing the counter happen in one
/// transaction.
pub struct LogStructuredAggregator {
    events: sled::Tree,
    counts: sled::Tree,
}

const SEPARATOR: u8 = 0;

fn counter_key(experiment_id: &str, variant_id: &str, kind: VariantEventKind) -> Vec<u8> {
    let mut key = experiment_id.as_bytes().to_vec();
    key.push(SEPARATOR);
    key.extend_from_slice(variant_id.as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(kind.as_str().as_bytes());
    key
}

fn decode_count(raw: &[u8]) -> u64 {
    raw.try_into().map(u64::from_be_bytes).unwrap_or(0)
}

impl LogStructuredAggregator {
    pub fn open(db: &sled::Db, namespace: &str) -> Result<LogStructuredAggregator> {
        Ok(LogStructuredAggregator {
            events: db.open_tree(format!("{namespace}/variant-events"))?,
            counts: db.open_tree(format!("{namespace}/variant-counts"))?,
        })
    }
}

#[async_trait]
impl VariantEventAggregator for LogStructuredAggregator {
    fn engine(&self) -> AggregatorEngine {
        AggregatorEngine::LevelDbLike
    }

    async fn record(&self, event: &VariantEvent) -> Result<()> {
        let key = counter_key(&event.experiment_id, &event.variant_id, event.kind);
        (&self.events, &self.counts)
            .transaction(|(events, counts)| {
                if events.insert(event.id.as_bytes(), &b""[..])?.is_some() {
                    return Ok(());
                }
                let current = counts.get(&key)?.map_or(0, |raw| decode_count(&raw));
                counts.insert(key.as_slice(), &(current + 1).to_be_bytes()[..])?;
                Ok::<_, ConflictableTransactionError<()>>(())
            })
            .map_err(|err| match err {
                TransactionError::Storage(err) => Error::from(err),
                TransactionError::Abort(()) => {
                    Error::unavailable(Engine::LevelDbLike, "variant event transaction aborted")
                }
            })
    }

    async fn aggregate(&self, experiment_id: &str) -> Result<ExperimentResults> {
        let mut prefix = experiment_id.as_bytes().to_vec();
        prefix.push(SEPARATOR);
        let mut results = ExperimentResults::new(experiment_id);
        for entry in self.counts.scan_prefix(&prefix) {
            let (key, raw) = entry?;
            let mut parts = key[prefix.len()..].split(|byte| *byte == SEPARATOR);
            let (Some(variant), Some(kind)) = (parts.next(), parts.next()) else {
                continue;
            };
            let kind = std::str::from_utf8(kind)
                .ok()
                .and_then(VariantEventKind::parse);
            if let (Ok(variant), Some(kind)) = (std::str::from_utf8(variant), kind) {
                results.add(variant, kind, decode_count(&raw));
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::tests::sample_event;

    #[tokio::test]
    async fn counts_survive_reopening() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let event = sample_event(1, "e", "A", VariantEventKind::Won);
        LogStructuredAggregator::open(&db, "test")
            .unwrap()
            .record(&event)
            .await
            .unwrap();

        let reopened = LogStructuredAggregator::open(&db, "test").unwrap();
        reopened.record(&event).await.unwrap();
        assert_eq!(reopened.aggregate("e").await.unwrap().variants["A"].won, 1);
    }
}
