//! A/B experiments: variant assignment, exposure and conversion recording, results.
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::{
    aggregator::{ExperimentResults, VariantEventAggregator, VariantEventKind},
    model::{Experiment, ExperimentEventRecord, Variant},
    sharder::{Md5Sharder, Sharder},
    store::VersionedDocumentStore,
    Document, EntityKind, Error, Result,
};

const TRAFFIC_SHARDS: u64 = 10_000;

/// Experiments are read from the `experiments` store. Displays and wins are written as
/// experiment-event documents and reach the aggregator through the event bus, so
/// [`ExperimentService::results`] is eventually consistent with recording.
pub struct ExperimentService {
    experiments: Arc<dyn VersionedDocumentStore>,
    events: Arc<dyn VersionedDocumentStore>,
    aggregator: Arc<dyn VariantEventAggregator>,
}

impl ExperimentService {
    pub fn new(
        experiments: Arc<dyn VersionedDocumentStore>,
        events: Arc<dyn VersionedDocumentStore>,
        aggregator: Arc<dyn VariantEventAggregator>,
    ) -> ExperimentService {
        ExperimentService {
            experiments,
            events,
            aggregator,
        }
    }

    pub async fn experiment(&self, experiment_id: &str) -> Result<Experiment> {
        let document = self
            .experiments
            .get(&EntityKind::Experiments.key(experiment_id))
            .await?;
        let mut experiment: Experiment = document.parse()?;
        if experiment.id.is_empty() {
            experiment.id = experiment_id.to_owned();
        }
        Ok(experiment)
    }

    /// The variant `client_id` is assigned to. The same client always gets the same variant as
    /// long as the experiment's variants are unchanged. `None` when the experiment is disabled.
    pub async fn variant_for(
        &self,
        experiment_id: &str,
        client_id: &str,
    ) -> Result<Option<Variant>> {
        let experiment = self.experiment(experiment_id).await?;
        if !experiment.enabled {
            log::debug!(target: "featurekit", experiment_id, client_id; "experiment is disabled");
            return Ok(None);
        }
        Ok(assign(&experiment, client_id, &Md5Sharder).cloned())
    }

    /// Record that `variant_id` was shown to `client_id`.
    pub async fn displayed(
        &self,
        experiment_id: &str,
        variant_id: &str,
        client_id: &str,
    ) -> Result<Document> {
        self.record(experiment_id, variant_id, client_id, VariantEventKind::Displayed)
            .await
    }

    /// Record that `client_id` converted while exposed to `variant_id`.
    pub async fn won(
        &self,
        experiment_id: &str,
        variant_id: &str,
        client_id: &str,
    ) -> Result<Document> {
        self.record(experiment_id, variant_id, client_id, VariantEventKind::Won)
            .await
    }

    async fn record(
        &self,
        experiment_id: &str,
        variant_id: &str,
        client_id: &str,
        kind: VariantEventKind,
    ) -> Result<Document> {
        let experiment = self.experiment(experiment_id).await?;
        if !experiment.variants.iter().any(|variant| variant.id == variant_id) {
            return Err(Error::InvalidDocument {
                key: EntityKind::Experiments.key(experiment_id),
                reason: format!("unknown variant {variant_id}"),
            });
        }

        let timestamp = Utc::now();
        let key = EntityKind::ExperimentEvents.key(&format!(
            "{experiment_id}/{variant_id}/{:020}-{:016x}",
            timestamp.timestamp_micros().max(0),
            rand::random::<u64>()
        ));
        let record = ExperimentEventRecord {
            experiment_id: experiment_id.to_owned(),
            variant_id: variant_id.to_owned(),
            client_id: client_id.to_owned(),
            kind,
            timestamp,
        };
        let value: Value = serde_json::to_value(&record)?;
        self.events.put(&key, value).await
    }

    /// Aggregated counts of every variant with recorded events.
    pub async fn results(&self, experiment_id: &str) -> Result<ExperimentResults> {
        self.aggregator.aggregate(experiment_id).await
    }
}

/// Walk the variants' cumulative traffic with the client's bucket. Rounding leftovers fall to the
/// last variant.
fn assign<'a>(
    experiment: &'a Experiment,
    client_id: &str,
    sharder: &impl Sharder,
) -> Option<&'a Variant> {
    let bucket = sharder.get_shard(format!("{}-{client_id}", experiment.id), TRAFFIC_SHARDS);
    let mut upper = 0.0;
    experiment
        .variants
        .iter()
        .find(|variant| {
            upper += variant.traffic * 100.0;
            (bucket as f64) < upper
        })
        .or_else(|| experiment.variants.last())
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use serde_json::json;

    use super::*;
    use crate::{
        aggregator::{spawn_recorder, MemoryAggregator},
        bus::{EventBus, LocalBus},
        config::{BusConfig, RetryPolicy},
        store::{event_queue, DocumentStore, MemoryBackend},
    };

    struct Fixture {
        service: ExperimentService,
        _tasks: Vec<tokio::task::JoinHandle<()>>,
    }

    fn fixture() -> Fixture {
        let bus: Arc<dyn EventBus> = Arc::new(LocalBus::new(BusConfig::DEFAULT_SUBSCRIBER_BUFFER));
        let (experiments_queue, experiments_outbox) = event_queue();
        let (events_queue, events_outbox) = event_queue();
        let experiments: Arc<dyn VersionedDocumentStore> = Arc::new(DocumentStore::new(
            EntityKind::Experiments,
            Box::new(MemoryBackend::new()),
            experiments_queue,
        ));
        let events: Arc<dyn VersionedDocumentStore> = Arc::new(DocumentStore::new(
            EntityKind::ExperimentEvents,
            Box::new(MemoryBackend::new()),
            events_queue,
        ));
        let aggregator: Arc<dyn VariantEventAggregator> = Arc::new(MemoryAggregator::new());
        let tasks = vec![
            tokio::spawn(experiments_outbox.run(bus.clone(), RetryPolicy::none())),
            tokio::spawn(events_outbox.run(bus.clone(), RetryPolicy::none())),
            spawn_recorder(bus, events.clone(), aggregator.clone(), RetryPolicy::none()),
        ];
        Fixture {
            service: ExperimentService::new(experiments, events, aggregator),
            _tasks: tasks,
        }
    }

    fn experiment(traffic: &[(&str, f64)]) -> Experiment {
        Experiment {
            id: "homepage".to_owned(),
            name: "Homepage".to_owned(),
            enabled: true,
            variants: traffic
                .iter()
                .map(|(id, traffic)| Variant {
                    id: id.to_string(),
                    name: String::new(),
                    traffic: *traffic,
                })
                .collect(),
        }
    }

    #[test]
    fn assignment_follows_traffic() {
        let experiment = experiment(&[("A", 20.0), ("B", 80.0)]);
        let mut counts = HashMap::new();
        for i in 0..5_000 {
            let variant = assign(&experiment, &format!("client-{i}"), &Md5Sharder).unwrap();
            *counts.entry(variant.id.as_str()).or_insert(0) += 1;
        }
        assert!((800..1_200).contains(&counts["A"]), "{counts:?}");
        assert_eq!(counts["A"] + counts["B"], 5_000);

        let first = assign(&experiment, "client-42", &Md5Sharder).unwrap();
        assert!((0..10).all(|_| assign(&experiment, "client-42", &Md5Sharder) == Some(first)));
    }

    #[test]
    fn leftover_traffic_goes_to_last_variant() {
        let experiment = experiment(&[("A", 0.0), ("B", 0.0)]);
        assert_eq!(assign(&experiment, "anyone", &Md5Sharder).unwrap().id, "B");
        assert!(assign(&self::experiment(&[]), "anyone", &Md5Sharder).is_none());
    }

    #[tokio::test]
    async fn records_displays_and_wins_into_results() {
        let Fixture { service, _tasks } = fixture();
        let experiment = experiment(&[("A", 50.0), ("B", 50.0)]);
        service
            .experiments
            .put("experiments/homepage", serde_json::to_value(&experiment).unwrap())
            .await
            .unwrap();

        let variant = service.variant_for("homepage", "client-1").await.unwrap().unwrap();
        assert!(["A", "B"].contains(&variant.id.as_str()));

        for client in ["c1", "c2", "c3", "c4"] {
            service.displayed("homepage", "A", client).await.unwrap();
            service.displayed("homepage", "B", client).await.unwrap();
        }
        service.won("homepage", "A", "c1").await.unwrap();
        service.won("homepage", "B", "c2").await.unwrap();
        service.won("homepage", "B", "c3").await.unwrap();
        assert!(service.won("homepage", "Z", "c1").await.is_err());

        let mut results = service.results("homepage").await.unwrap();
        for _ in 0..100 {
            if results.variants.values().map(|c| c.displayed + c.won).sum::<u64>() == 11 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            results = service.results("homepage").await.unwrap();
        }
        assert_eq!(results.variants["A"].displayed, 4);
        assert_eq!(results.variants["A"].won, 1);
        assert_eq!(results.variants["B"].won, 2);
        assert_eq!(results.winner().map(|(id, _)| id), Some("B"));
    }

    #[tokio::test]
    async fn disabled_experiments_assign_nothing() {
        let Fixture { service, _tasks } = fixture();
        service
            .experiments
            .put(
                "experiments/off",
                json!({"enabled": false, "variants": [{"id": "A", "traffic": 100.0}]}),
            )
            .await
            .unwrap();
        assert_eq!(service.variant_for("off", "client").await.unwrap(), None);
        assert!(service.variant_for("missing", "client").await.is_err());
    }
}
