//! Per-variant exposure and conversion counts of experiments.
//!
//! Every engine counts each [`VariantEvent`] exactly once, keyed by the event id, so replaying the
//! event log into any engine converges on the numbers [`ExperimentResults::from_events`] computes.
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use serde::{ser::SerializeStruct, Deserialize, Serialize, Serializer};
use tokio::task::JoinHandle;

use crate::{
    adapter::{recorded_variant_event, variant_event},
    bus::{Deduplicator, EventBus, EventFilter},
    config::{AggregatorEngine, RetryPolicy},
    store::VersionedDocumentStore,
    EntityKind, Result,
};

mod distributed_log;
mod document_db;
mod kv;
mod log_structured;
mod memory;
mod search_index;
mod wide_column;

pub use distributed_log::LogAggregator;
pub use document_db::DocumentDbAggregator;
pub use kv::KvAggregator;
pub use log_structured::LogStructuredAggregator;
pub use memory::MemoryAggregator;
pub use search_index::SearchIndexAggregator;
pub use wide_column::WideColumnAggregator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariantEventKind {
    /// The variant was shown to a subject.
    Displayed,
    /// The subject converted.
    Won,
}

impl VariantEventKind {
    pub const ALL: [VariantEventKind; 2] = [VariantEventKind::Displayed, VariantEventKind::Won];

    pub fn as_str(self) -> &'static str {
        match self {
            VariantEventKind::Displayed => "displayed",
            VariantEventKind::Won => "won",
        }
    }

    pub fn parse(s: &str) -> Option<VariantEventKind> {
        VariantEventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
    }
}

/// An exposure or conversion. `id` is the key of the experiment-event document it was derived
/// from and identifies the event across redeliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantEvent {
    pub id: String,
    pub experiment_id: String,
    pub variant_id: String,
    pub kind: VariantEventKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct VariantCounts {
    pub displayed: u64,
    pub won: u64,
}

impl VariantCounts {
    /// Conversions per exposure, 0 when never displayed.
    pub fn win_ratio(&self) -> f64 {
        if self.displayed == 0 {
            0.0
        } else {
            self.won as f64 / self.displayed as f64
        }
    }

    pub fn count(&self, kind: VariantEventKind) -> u64 {
        match kind {
            VariantEventKind::Displayed => self.displayed,
            VariantEventKind::Won => self.won,
        }
    }

    pub fn add(&mut self, kind: VariantEventKind, n: u64) {
        match kind {
            VariantEventKind::Displayed => self.displayed += n,
            VariantEventKind::Won => self.won += n,
        }
    }
}

impl Serialize for VariantCounts {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("VariantCounts", 3)?;
        state.serialize_field("displayed", &self.displayed)?;
        state.serialize_field("won", &self.won)?;
        state.serialize_field("winRatio", &self.win_ratio())?;
        state.end()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentResults {
    pub experiment_id: String,
    pub variants: BTreeMap<String, VariantCounts>,
}

impl ExperimentResults {
    pub fn new(experiment_id: impl Into<String>) -> ExperimentResults {
        ExperimentResults {
            experiment_id: experiment_id.into(),
            variants: BTreeMap::new(),
        }
    }

    /// Reference fold: the results of `events`, counting each event id once and ignoring events
    /// of other experiments.
    pub fn from_events<'a>(
        experiment_id: &str,
        events: impl IntoIterator<Item = &'a VariantEvent>,
    ) -> ExperimentResults {
        let mut results = ExperimentResults::new(experiment_id);
        let mut seen = HashSet::new();
        for event in events {
            if event.experiment_id == experiment_id && seen.insert(event.id.as_str()) {
                results.add(&event.variant_id, event.kind, 1);
            }
        }
        results
    }

    pub fn add(&mut self, variant_id: &str, kind: VariantEventKind, n: u64) {
        self.variants
            .entry(variant_id.to_owned())
            .or_default()
            .add(kind, n);
    }

    /// The displayed variant with the highest win ratio, the first in id order on ties.
    pub fn winner(&self) -> Option<(&str, &VariantCounts)> {
        self.variants
            .iter()
            .filter(|(_, counts)| counts.displayed > 0)
            .fold(None, |best: Option<(&String, &VariantCounts)>, candidate| match best {
                Some(best) if best.1.win_ratio() >= candidate.1.win_ratio() => Some(best),
                _ => Some(candidate),
            })
            .map(|(id, counts)| (id.as_str(), counts))
    }
}

/// Counts variant events in one engine.
#[async_trait]
pub trait VariantEventAggregator: Send + Sync {
    fn engine(&self) -> AggregatorEngine;

    /// Count `event`. Recording an event id that was already counted has no effect.
    async fn record(&self, event: &VariantEvent) -> Result<()>;

    /// Counts of every variant of `experiment_id` with at least one event.
    async fn aggregate(&self, experiment_id: &str) -> Result<ExperimentResults>;
}

async fn record_with_retry(
    aggregator: &dyn VariantEventAggregator,
    event: &VariantEvent,
    retry: &RetryPolicy,
) {
    let mut attempt = 0;
    loop {
        match aggregator.record(event).await {
            Ok(()) => return,
            Err(err) if err.is_transient() && attempt + 1 < retry.max_attempts => {
                attempt += 1;
                log::warn!(
                    target: "featurekit",
                    event_id = event.id.as_str(),
                    attempt,
                    error:% = err;
                    "failed to record variant event, retrying"
                );
                tokio::time::sleep(retry.delay(attempt)).await;
            }
            Err(err) => {
                log::error!(
                    target: "featurekit",
                    engine:% = aggregator.engine(),
                    event_id = event.id.as_str(),
                    error:% = err;
                    "failed to record variant event"
                );
                return;
            }
        }
    }
}

/// Record every variant event already stored in `events`. Safe to repeat since recording is
/// idempotent.
pub async fn replay(
    events: &dyn VersionedDocumentStore,
    aggregator: &dyn VariantEventAggregator,
    retry: &RetryPolicy,
) -> Result<u64> {
    let prefix = EntityKind::ExperimentEvents.prefix();
    let mut documents = events.find_by_prefix(&prefix, None);
    let mut replayed = 0;
    while let Some(document) = documents.try_next().await? {
        if let Some(event) = recorded_variant_event(&document.key, &document.value) {
            record_with_retry(aggregator, &event, retry).await;
            replayed += 1;
        }
    }
    log::info!(
        target: "featurekit",
        engine:% = aggregator.engine(),
        replayed;
        "replayed variant events"
    );
    Ok(replayed)
}

/// Feed the variant events derived from experiment-event writes on `bus` into `aggregator`.
///
/// A subscriber dropped for falling behind resubscribes and replays the stored events, so no
/// event is lost for good.
pub fn spawn_recorder(
    bus: Arc<dyn EventBus>,
    events: Arc<dyn VersionedDocumentStore>,
    aggregator: Arc<dyn VariantEventAggregator>,
    retry: RetryPolicy,
) -> JoinHandle<()> {
    let filter = EventFilter::kinds([EntityKind::ExperimentEvents]);
    let mut subscription = bus.subscribe(filter.clone());
    tokio::spawn(async move {
        let mut deduplicator = Deduplicator::new();
        loop {
            let mut lagged = false;
            while let Some(delivery) = subscription.next().await {
                match delivery {
                    Ok(event) => {
                        if !deduplicator.first_delivery(&event) {
                            continue;
                        }
                        if let Some(variant_event) = variant_event(&event) {
                            record_with_retry(aggregator.as_ref(), &variant_event, &retry).await;
                        }
                    }
                    Err(err) => {
                        log::warn!(
                            target: "featurekit",
                            engine:% = aggregator.engine(),
                            error:% = err;
                            "variant event recorder lagged, replaying"
                        );
                        lagged = true;
                    }
                }
            }
            if !lagged {
                log::debug!(
                    target: "featurekit",
                    engine:% = aggregator.engine();
                    "event bus closed, stopping variant event recorder"
                );
                return;
            }
            subscription = bus.subscribe(filter.clone());
            deduplicator.clear();
            if let Err(err) = replay(events.as_ref(), aggregator.as_ref(), &retry).await {
                log::error!(
                    target: "featurekit",
                    engine:% = aggregator.engine(),
                    error:% = err;
                    "failed to replay variant events"
                );
            }
        }
    })
}
