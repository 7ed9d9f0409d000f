use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{ExperimentResults, VariantEvent, VariantEventAggregator, VariantEventKind};
use crate::{
    config::AggregatorEngine,
    driver::{SearchIndex, WriteCondition},
    Result,
};

/// Elastic-like: one document per event in index `{namespace}-variant-events`, created with
/// `op_type=create` under the event id. Counts come from a terms aggregation on variant and kind.
pub struct SearchIndexAggregator {
    index: Arc<dyn SearchIndex>,
    name: String,
}

impl SearchIndexAggregator {
    pub fn new(index: Arc<dyn SearchIndex>, namespace: &str) -> SearchIndexAggregator {
        SearchIndexAggregator {
            index,
            // Index names must be lowercase.
            name: format!("{}-variant-events", namespace.to_lowercase()),
        }
    }
}

#[async_trait]
impl VariantEventAggregator for SearchIndexAggregator {
    fn engine(&self) -> AggregatorEngine {
        AggregatorEngine::ElasticLike
    }

    async fn record(&self, event: &VariantEvent) -> Result<()> {
        let source = json!({
            "experimentId": event.experiment_id,
            "variantId": event.variant_id,
            "kind": event.kind.as_str(),
            "timestamp": event.timestamp,
        });
        self.index
            .index(&self.name, &event.id, source, WriteCondition::Create)
            .await?;
        Ok(())
    }

    async fn aggregate(&self, experiment_id: &str) -> Result<ExperimentResults> {
        let buckets = self
            .index
            .count_by(
                &self.name,
                &[("experimentId".to_owned(), json!(experiment_id))],
                &["variantId", "kind"],
            )
            .await?;
        let mut results = ExperimentResults::new(experiment_id);
        for (key, count) in buckets {
            if let [variant, kind] = key.as_slice() {
                if let Some(kind) = VariantEventKind::parse(kind) {
                    results.add(variant, kind, count);
                }
            }
        }
        Ok(results)
    }
}
