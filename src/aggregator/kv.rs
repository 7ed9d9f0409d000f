use std::sync::Arc;

use async_trait::async_trait;
use url::form_urlencoded;

use super::{ExperimentResults, VariantEvent, VariantEventAggregator, VariantEventKind};
use crate::{config::AggregatorEngine, driver::escape_glob, driver::KvConnection, Result};

/// Redis-like counters: `SET NX` on a per-event marker, then `INCRBY` on
/// `{namespace}:variant-counts:{experiment}:{variant}:{kind}`. Ids are form-encoded so they never
/// contain the `:` separator.
///
/// A failed increment releases the marker again, so the event is counted when it is retried.
pub struct KvAggregator {
    connection: Arc<dyn KvConnection>,
    namespace: String,
}

fn encode(component: &str) -> String {
    form_urlencoded::byte_serialize(component.as_bytes()).collect()
}

fn decode(component: &str) -> String {
    form_urlencoded::parse(component.as_bytes())
        .next()
        .map(|(decoded, _)| decoded.into_owned())
        .unwrap_or_default()
}

impl KvAggregator {
    pub fn new(connection: Arc<dyn KvConnection>, namespace: impl Into<String>) -> KvAggregator {
        KvAggregator {
            connection,
            namespace: namespace.into(),
        }
    }

    fn marker_key(&self, event_id: &str) -> String {
        format!("{}:variant-events:{}", self.namespace, encode(event_id))
    }

    fn counters_prefix(&self, experiment_id: &str) -> String {
        format!("{}:variant-counts:{}:", self.namespace, encode(experiment_id))
    }
}

#[async_trait]
impl VariantEventAggregator for KvAggregator {
    fn engine(&self) -> AggregatorEngine {
        AggregatorEngine::RedisLike
    }

    async fn record(&self, event: &VariantEvent) -> Result<()> {
        let marker = self.marker_key(&event.id);
        let timestamp = event.timestamp.to_rfc3339();
        if !self.connection.set_if(&marker, None, Some(&timestamp)).await? {
            return Ok(());
        }
        let counter = format!(
            "{}{}:{}",
            self.counters_prefix(&event.experiment_id),
            encode(&event.variant_id),
            event.kind.as_str()
        );
        if let Err(err) = self.connection.incr_by(&counter, 1).await {
            if let Err(release) = self.connection.set_if(&marker, Some(&timestamp), None).await {
                log::error!(
                    target: "featurekit",
                    event_id = event.id.as_str(),
                    error:% = release;
                    "failed to release variant event marker, the event stays uncounted"
                );
            }
            return Err(err);
        }
        Ok(())
    }

    async fn aggregate(&self, experiment_id: &str) -> Result<ExperimentResults> {
        let prefix = self.counters_prefix(experiment_id);
        let mut results = ExperimentResults::new(experiment_id);
        for key in self
            .connection
            .scan(&format!("{}*", escape_glob(&prefix)))
            .await?
        {
            let Some((variant, kind)) = key
                .strip_prefix(&prefix)
                .and_then(|counter| counter.split_once(':'))
            else {
                continue;
            };
            let Some(kind) = VariantEventKind::parse(kind) else {
                continue;
            };
            let count = match self.connection.get(&key).await? {
                Some(value) => value.parse::<u64>().unwrap_or_else(|_| {
                    log::warn!(
                        target: "featurekit",
                        key = key.as_str();
                        "ignoring non-numeric counter"
                    );
                    0
                }),
                None => 0,
            };
            results.add(&decode(variant), kind, count);
        }
        Ok(results)
    }
}
