//! The dependency-injection root.
use std::{collections::HashMap, fmt::Display, sync::Arc, time::Duration};

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::{
    aggregator::{
        replay, spawn_recorder, DocumentDbAggregator, KvAggregator, LogAggregator,
        LogStructuredAggregator, MemoryAggregator, SearchIndexAggregator, VariantEventAggregator,
        WideColumnAggregator,
    },
    bus::{EventBus, LocalBus, LogBus, PubSubBus},
    cache::CachedStore,
    config::AggregatorEngine,
    driver::Drivers,
    experiment::ExperimentService,
    feature::FeatureEvaluator,
    script::ScriptSandbox,
    store::{
        event_queue, Backend, DocumentDbBackend, DocumentStore, ImportReport, KvBackend,
        LogStructuredBackend, MemoryBackend, SearchIndexBackend, VersionedDocumentStore,
        WideColumnBackend,
    },
    Config, Engine, EntityKind, Error, Result, Transport,
};

/// How long [`Registry::shutdown`] waits for queued events to be published.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Owns every component of a running service, built once from a [`Config`] and the
/// infrastructure [`Drivers`].
///
/// Components are built in dependency order: stores, bus, event outboxes, caches and their
/// invalidation subscribers, aggregator and its recorder, script sandbox, then the feature
/// evaluator and the experiment service. Background tasks are aborted when the registry is dropped;
/// use [`Registry::shutdown`] to publish queued events first.
pub struct Registry {
    config: Config,
    /// Store of every entity kind as seen by callers, behind its cache when caching is enabled.
    stores: HashMap<EntityKind, Arc<dyn VersionedDocumentStore>>,
    caches: HashMap<EntityKind, Arc<CachedStore>>,
    bus: Arc<dyn EventBus>,
    aggregator: Arc<dyn VariantEventAggregator>,
    sandbox: Arc<ScriptSandbox>,
    features: FeatureEvaluator,
    experiments: ExperimentService,
    tasks: Tasks,
}

#[derive(Default)]
struct Tasks {
    outboxes: Vec<JoinHandle<()>>,
    subscribers: Vec<JoinHandle<()>>,
}

impl Drop for Tasks {
    fn drop(&mut self) {
        for task in self.subscribers.iter().chain(&self.outboxes) {
            task.abort();
        }
    }
}

impl Registry {
    /// Build every component. Must be called within a tokio runtime.
    ///
    /// An engine or transport whose driver is missing from `drivers` fails with
    /// [`Error::Configuration`].
    pub async fn build(config: Config, drivers: Drivers) -> Result<Registry> {
        let namespace = config.namespace.clone();
        let sled = open_sled(&config, &drivers)?;

        let mut raw_stores = HashMap::new();
        let mut outboxes = Vec::new();
        for kind in EntityKind::ALL {
            let engine = config.engine_for(kind);
            let backend = backend(engine, &drivers, sled.as_ref(), &namespace)?;
            let (queue, outbox) = event_queue();
            let store = DocumentStore::new(kind, backend, queue)
                .with_retry(config.retry.clone())
                .with_page_size(config.page_size);
            log::debug!(
                target: "featurekit",
                entity_kind:% = kind,
                engine:% = engine;
                "built store"
            );
            raw_stores.insert(kind, Arc::new(store) as Arc<dyn VersionedDocumentStore>);
            outboxes.push(outbox);
        }

        let bus = event_bus(&config, &drivers).await?;
        let mut tasks = Tasks::default();
        for outbox in outboxes {
            tasks
                .outboxes
                .push(tokio::spawn(outbox.run(bus.clone(), config.retry.clone())));
        }

        let mut stores = HashMap::new();
        let mut caches = HashMap::new();
        for (kind, store) in &raw_stores {
            // Experiment events are append-only and read only by aggregation.
            if !config.cache.enabled || *kind == EntityKind::ExperimentEvents {
                stores.insert(*kind, store.clone());
                continue;
            }
            let cache = Arc::new(CachedStore::new(store.clone()));
            tasks
                .subscribers
                .push(cache.clone().spawn_invalidation(bus.clone()));
            stores.insert(*kind, cache.clone() as Arc<dyn VersionedDocumentStore>);
            caches.insert(*kind, cache);
        }

        let events = raw_stores[&EntityKind::ExperimentEvents].clone();
        let aggregator = aggregator(&config, &drivers, sled.as_ref())?;
        tasks.subscribers.push(spawn_recorder(
            bus.clone(),
            events.clone(),
            aggregator.clone(),
            config.retry.clone(),
        ));
        replay(events.as_ref(), aggregator.as_ref(), &config.retry).await?;

        let sandbox = Arc::new(match &drivers.http {
            Some(http) => ScriptSandbox::with_http(config.sandbox.clone(), http.clone()),
            None => ScriptSandbox::new(config.sandbox.clone()),
        });

        let features = FeatureEvaluator::new(
            stores[&EntityKind::Flags].clone(),
            stores[&EntityKind::Scripts].clone(),
            sandbox.clone(),
        );
        let experiments = ExperimentService::new(
            stores[&EntityKind::Experiments].clone(),
            events,
            aggregator.clone(),
        );

        log::info!(
            target: "featurekit",
            namespace = namespace.as_str(),
            transport:? = config.transport,
            cache = config.cache.enabled;
            "registry started"
        );
        Ok(Registry {
            config,
            stores,
            caches,
            bus,
            aggregator,
            sandbox,
            features,
            experiments,
            tasks,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The store of `kind`, cached when caching is enabled.
    pub fn store(&self, kind: EntityKind) -> Arc<dyn VersionedDocumentStore> {
        self.stores[&kind].clone()
    }

    /// The cache in front of the store of `kind`, if any.
    pub fn cache(&self, kind: EntityKind) -> Option<Arc<CachedStore>> {
        self.caches.get(&kind).cloned()
    }

    pub fn bus(&self) -> Arc<dyn EventBus> {
        self.bus.clone()
    }

    pub fn aggregator(&self) -> Arc<dyn VariantEventAggregator> {
        self.aggregator.clone()
    }

    pub fn sandbox(&self) -> Arc<ScriptSandbox> {
        self.sandbox.clone()
    }

    pub fn features(&self) -> &FeatureEvaluator {
        &self.features
    }

    pub fn experiments(&self) -> &ExperimentService {
        &self.experiments
    }

    /// Import `records` into the store of `kind`. See
    /// [`VersionedDocumentStore::bulk_import`].
    pub async fn bulk_import(&self, kind: EntityKind, records: Vec<Value>) -> ImportReport {
        let report = self.stores[&kind].bulk_import(records).await;
        log::info!(
            target: "featurekit",
            entity_kind:% = kind,
            imported = report.imported,
            failed = report.failures.len();
            "bulk import finished"
        );
        report
    }

    /// Stop subscribers, then wait for every event already queued by the stores to be
    /// published.
    ///
    /// Store handles obtained from the registry keep their event queue open, so they should be
    /// dropped first. Outboxes still running after a grace period are aborted.
    pub async fn shutdown(self) {
        let Registry {
            mut tasks,
            stores,
            caches,
            features,
            experiments,
            ..
        } = self;
        for task in tasks.subscribers.drain(..) {
            task.abort();
        }
        drop((stores, caches, features, experiments));
        for outbox in tasks.outboxes.drain(..) {
            let abort = outbox.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, outbox).await.is_err() {
                abort.abort();
                log::warn!(
                    target: "featurekit",
                    "event outbox did not drain in time, queued events dropped"
                );
            }
        }
        log::info!(target: "featurekit", "registry stopped");
    }
}

fn missing_driver(engine: impl Display, driver: &str) -> Error {
    Error::Configuration(format!("{engine} requires a {driver} driver"))
}

fn require<T: Clone>(handle: &Option<T>, engine: impl Display, driver: &str) -> Result<T> {
    handle.clone().ok_or_else(|| missing_driver(engine, driver))
}

/// The `sled` database, when some engine needs one. Falls back to opening `data_dir`.
fn open_sled(config: &Config, drivers: &Drivers) -> Result<Option<sled::Db>> {
    let needed = EntityKind::ALL
        .into_iter()
        .any(|kind| config.engine_for(kind) == Engine::LevelDbLike)
        || config.aggregator_engine == AggregatorEngine::LevelDbLike;
    if !needed {
        return Ok(None);
    }
    match (&drivers.sled, &config.data_dir) {
        (Some(db), _) => Ok(Some(db.clone())),
        (None, Some(dir)) => {
            log::info!(target: "featurekit", data_dir:? = dir; "opening level-db-like engine");
            Ok(Some(sled::open(dir)?))
        }
        (None, None) => Err(missing_driver(Engine::LevelDbLike, "sled (or dataDir)")),
    }
}

fn backend(
    engine: Engine,
    drivers: &Drivers,
    sled: Option<&sled::Db>,
    namespace: &str,
) -> Result<Box<dyn Backend>> {
    Ok(match engine {
        Engine::InMemory => Box::new(MemoryBackend::new()),
        Engine::RedisLike => Box::new(KvBackend::new(
            require(&drivers.kv, engine, "key-value")?,
            namespace,
        )),
        Engine::CassandraLike => Box::new(WideColumnBackend::new(
            require(&drivers.wide_column, engine, "wide-column")?,
            namespace,
        )),
        Engine::DynamoLike => Box::new(
            WideColumnBackend::new(require(&drivers.wide_column, engine, "wide-column")?, namespace)
                .with_engine(Engine::DynamoLike),
        ),
        Engine::ElasticLike => Box::new(SearchIndexBackend::new(
            require(&drivers.search, engine, "search")?,
            namespace,
        )),
        Engine::MongoLike => Box::new(DocumentDbBackend::new(
            require(&drivers.documents, engine, "document database")?.as_ref(),
            namespace,
        )),
        Engine::LevelDbLike => {
            let db = sled.ok_or_else(|| missing_driver(engine, "sled"))?;
            Box::new(LogStructuredBackend::open(db, namespace)?)
        }
    })
}

async fn event_bus(config: &Config, drivers: &Drivers) -> Result<Arc<dyn EventBus>> {
    let topic = format!("{}.domain-events", config.namespace);
    Ok(match config.transport {
        Transport::InMemory => Arc::new(LocalBus::new(config.bus.subscriber_buffer)),
        Transport::KafkaLike => {
            let event_log = require(&drivers.event_log, "kafka-like transport", "event log")?;
            Arc::new(LogBus::start(event_log, topic, &config.bus).await?)
        }
        Transport::RedisPubSub | Transport::DistributedPubSub => {
            let broker = require(&drivers.broker, "pub/sub transport", "broker")?;
            Arc::new(PubSubBus::start(broker, topic, config.bus.subscriber_buffer).await?)
        }
    })
}

fn aggregator(
    config: &Config,
    drivers: &Drivers,
    sled: Option<&sled::Db>,
) -> Result<Arc<dyn VariantEventAggregator>> {
    let namespace = config.namespace.as_str();
    let engine = config.aggregator_engine;
    Ok(match engine {
        AggregatorEngine::InMemory => Arc::new(MemoryAggregator::new()),
        AggregatorEngine::RedisLike => {
            Arc::new(KvAggregator::new(require(&drivers.kv, engine, "key-value")?, namespace))
        }
        AggregatorEngine::CassandraLike => Arc::new(WideColumnAggregator::new(
            require(&drivers.wide_column, engine, "wide-column")?,
            namespace,
        )),
        AggregatorEngine::DynamoLike => Arc::new(
            WideColumnAggregator::new(
                require(&drivers.wide_column, engine, "wide-column")?,
                namespace,
            )
            .with_engine(Engine::DynamoLike),
        ),
        AggregatorEngine::ElasticLike => Arc::new(SearchIndexAggregator::new(
            require(&drivers.search, engine, "search")?,
            namespace,
        )),
        AggregatorEngine::MongoLike => Arc::new(DocumentDbAggregator::new(
            require(&drivers.documents, engine, "document database")?.as_ref(),
            namespace,
        )),
        AggregatorEngine::LevelDbLike => {
            let db = sled.ok_or_else(|| missing_driver(engine, "sled"))?;
            Arc::new(LogStructuredAggregator::open(db, namespace)?)
        }
        AggregatorEngine::DistributedLog => Arc::new(LogAggregator::new(
            require(&drivers.event_log, engine, "event log")?,
            format!("{namespace}.variant-events"),
            config.bus.partitions,
        )),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::BusConfig;

    async fn eventually<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..300 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn fast_bus() -> BusConfig {
        BusConfig {
            poll_wait: Duration::from_millis(20),
            ..BusConfig::default()
        }
    }

    #[tokio::test]
    async fn missing_drivers_are_configuration_errors() {
        let cases = [
            Config::default().with_engine(EntityKind::Flags, Engine::RedisLike),
            Config::default().with_default_engine(Engine::LevelDbLike),
            Config::default().with_transport(Transport::KafkaLike),
            Config::default().with_transport(Transport::RedisPubSub),
            Config::default().with_aggregator_engine(AggregatorEngine::DistributedLog),
            Config::default().with_aggregator_engine(Engine::MongoLike),
        ];
        for config in cases {
            match Registry::build(config.clone(), Drivers::none()).await {
                Err(Error::Configuration(_)) => {}
                Err(err) => panic!("{config:?}: unexpected error {err}"),
                Ok(_) => panic!("{config:?}: built without driver"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serves_flags_and_experiments_in_memory() {
        let registry = Registry::build(Config::default(), Drivers::none()).await.unwrap();
        let flags = registry.store(EntityKind::Flags);

        flags
            .put("flags/beta", json!({"enabled": true, "activationStrategy": "Always"}))
            .await
            .unwrap();
        assert!(registry.features().is_active("beta", &json!({})).await.unwrap());

        flags
            .put("flags/beta", json!({"enabled": false, "activationStrategy": "Always"}))
            .await
            .unwrap();
        assert!(!registry.features().is_active("beta", &json!({})).await.unwrap());

        let staff_only = r#"if (context.email.endsWith("@acme.test")) enabled() else disabled()"#;
        registry
            .store(EntityKind::Scripts)
            .put("scripts/staff", json!({"language": "js", "source": staff_only}))
            .await
            .unwrap();
        flags
            .put(
                "flags/staff-only",
                json!({"enabled": true, "activationStrategy": {"Script": {"scriptId": "staff"}}}),
            )
            .await
            .unwrap();
        let features = registry.features();
        let staff = json!({"email": "ann@acme.test"});
        let outsider = json!({"email": "bob@else.test"});
        assert!(features.is_active("staff-only", &staff).await.unwrap());
        assert!(!features.is_active("staff-only", &outsider).await.unwrap());
        assert!(!features.is_active("staff-only", &json!({})).await.unwrap());

        drop(flags);
        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bulk_import_goes_through_the_cache() {
        let registry = Registry::build(Config::default(), Drivers::none()).await.unwrap();
        let configs = registry.store(EntityKind::Configs);
        assert_eq!(configs.count("configs/").await.unwrap(), 0);

        let report = registry
            .bulk_import(
                EntityKind::Configs,
                vec![
                    json!({"id": "limits", "value": {"value": {"rps": 10}}}),
                    json!({"key": "configs/theme", "value": {"value": "dark"}}),
                    json!({"key": "configs/bad", "value": {"nope": 1}}),
                ],
            )
            .await;
        assert_eq!(report.imported, 2);
        assert_eq!(report.failures.len(), 1);
        let cache = registry.cache(EntityKind::Configs).unwrap();
        assert_eq!(cache.list("configs/").await.unwrap().len(), 2);
        assert!(registry.cache(EntityKind::ExperimentEvents).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn every_engine_and_transport_serves_experiments() {
        let engines = [
            (Engine::RedisLike, AggregatorEngine::RedisLike, Transport::KafkaLike),
            (Engine::CassandraLike, AggregatorEngine::DistributedLog, Transport::RedisPubSub),
            (Engine::DynamoLike, AggregatorEngine::DynamoLike, Transport::DistributedPubSub),
            (Engine::ElasticLike, AggregatorEngine::ElasticLike, Transport::InMemory),
            (Engine::LevelDbLike, AggregatorEngine::LevelDbLike, Transport::KafkaLike),
            (Engine::MongoLike, AggregatorEngine::MongoLike, Transport::InMemory),
        ];
        for (engine, aggregator_engine, transport) in engines {
            let mut config = Config::default()
                .with_default_engine(engine)
                .with_aggregator_engine(aggregator_engine)
                .with_transport(transport);
            config.bus = fast_bus();
            let registry = Registry::build(config, Drivers::embedded().unwrap()).await.unwrap();
            assert_eq!(registry.aggregator().engine(), aggregator_engine);

            registry
                .store(EntityKind::Experiments)
                .put(
                    "experiments/checkout",
                    json!({"enabled": true, "variants": [
                        {"id": "A", "traffic": 50.0},
                        {"id": "B", "traffic": 50.0}
                    ]}),
                )
                .await
                .unwrap();
            let experiments = registry.experiments();
            let variant = experiments.variant_for("checkout", "c1").await.unwrap().unwrap();
            experiments.displayed("checkout", &variant.id, "c1").await.unwrap();
            experiments.won("checkout", &variant.id, "c1").await.unwrap();

            let variant_id = variant.id.as_str();
            eventually(|| async move {
                let results = experiments.results("checkout").await.unwrap();
                results
                    .variants
                    .get(variant_id)
                    .is_some_and(|counts| counts.displayed == 1 && counts.won == 1)
            })
            .await;
            registry.shutdown().await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replays_stored_events_into_a_fresh_aggregator() {
        let drivers = Drivers::embedded().unwrap();
        let config = Config::default().with_engine(EntityKind::ExperimentEvents, Engine::RedisLike);

        let first = Registry::build(config.clone(), drivers.clone()).await.unwrap();
        first
            .store(EntityKind::Experiments)
            .put(
                "experiments/signup",
                json!({"enabled": true, "variants": [{"id": "A", "traffic": 100.0}]}),
            )
            .await
            .unwrap();
        for client in ["c1", "c2", "c3"] {
            first.experiments().displayed("signup", "A", client).await.unwrap();
        }
        first.shutdown().await;

        // Experiments themselves lived in memory; the events survive in the kv driver.
        let second = Registry::build(config, drivers).await.unwrap();
        let results = second.experiments().results("signup").await.unwrap();
        assert_eq!(results.variants["A"].displayed, 3);
    }
}
