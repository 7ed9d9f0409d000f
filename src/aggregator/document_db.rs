use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{ExperimentResults, VariantEvent, VariantEventAggregator, VariantEventKind};
use crate::{
    config::AggregatorEngine,
    driver::{DocumentCollection, DocumentDatabase, Filter, ID_FIELD},
    Result,
};

/// Mongo-like: one document per event in `{namespace}_variant_events`, keyed by event id so a
/// redelivery is a duplicate-key insert. Counts are computed by the query.
pub struct DocumentDbAggregator {
    collection: Arc<dyn DocumentCollection>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEvent {
    variant_id: String,
    kind: VariantEventKind,
}

impl DocumentDbAggregator {
    pub fn new(database: &dyn DocumentDatabase, namespace: &str) -> DocumentDbAggregator {
        DocumentDbAggregator {
            collection: database.collection(&format!("{namespace}_variant_events")),
        }
    }
}

#[async_trait]
impl VariantEventAggregator for DocumentDbAggregator {
    fn engine(&self) -> AggregatorEngine {
        AggregatorEngine::MongoLike
    }

    async fn record(&self, event: &VariantEvent) -> Result<()> {
        let inserted = self
            .collection
            .insert_one(json!({
                ID_FIELD: event.id,
                "experimentId": event.experiment_id,
                "variantId": event.variant_id,
                "kind": event.kind,
                "timestamp": event.timestamp,
            }))
            .await?;
        if !inserted {
            log::trace!(
                target: "featurekit",
                event_id = event.id.as_str();
                "variant event already recorded"
            );
        }
        Ok(())
    }

    async fn aggregate(&self, experiment_id: &str) -> Result<ExperimentResults> {
        let filter = Filter::default().field("experimentId", experiment_id);
        let mut results = ExperimentResults::new(experiment_id);
        for document in self.collection.find(&filter, None).await? {
            let stored = StoredEvent::deserialize(&document)?;
            results.add(&stored.variant_id, stored.kind, 1);
        }
        Ok(results)
    }
}
