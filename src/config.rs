//! Service configuration: storage engine per entity kind, event transport and component tuning.
use std::{collections::HashMap, fmt, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::document::EntityKind;

/// Storage engines a store or an aggregator can be backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Engine {
    InMemory,
    RedisLike,
    CassandraLike,
    ElasticLike,
    LevelDbLike,
    MongoLike,
    DynamoLike,
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Engine::InMemory => "in-memory",
            Engine::RedisLike => "redis-like",
            Engine::CassandraLike => "cassandra-like",
            Engine::ElasticLike => "elastic-like",
            Engine::LevelDbLike => "level-db-like",
            Engine::MongoLike => "mongo-like",
            Engine::DynamoLike => "dynamo-like",
        })
    }
}

/// Engines the variant event aggregator can count on: any storage engine, or a fold over a
/// distributed log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregatorEngine {
    InMemory,
    RedisLike,
    CassandraLike,
    ElasticLike,
    LevelDbLike,
    MongoLike,
    DynamoLike,
    DistributedLog,
}

impl From<Engine> for AggregatorEngine {
    fn from(engine: Engine) -> AggregatorEngine {
        match engine {
            Engine::InMemory => AggregatorEngine::InMemory,
            Engine::RedisLike => AggregatorEngine::RedisLike,
            Engine::CassandraLike => AggregatorEngine::CassandraLike,
            Engine::ElasticLike => AggregatorEngine::ElasticLike,
            Engine::LevelDbLike => AggregatorEngine::LevelDbLike,
            Engine::MongoLike => AggregatorEngine::MongoLike,
            Engine::DynamoLike => AggregatorEngine::DynamoLike,
        }
    }
}

impl fmt::Display for AggregatorEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregatorEngine::InMemory => Engine::InMemory.fmt(f),
            AggregatorEngine::RedisLike => Engine::RedisLike.fmt(f),
            AggregatorEngine::CassandraLike => Engine::CassandraLike.fmt(f),
            AggregatorEngine::ElasticLike => Engine::ElasticLike.fmt(f),
            AggregatorEngine::LevelDbLike => Engine::LevelDbLike.fmt(f),
            AggregatorEngine::MongoLike => Engine::MongoLike.fmt(f),
            AggregatorEngine::DynamoLike => Engine::DynamoLike.fmt(f),
            AggregatorEngine::DistributedLog => f.write_str("distributed-log"),
        }
    }
}

/// Event transports the bus can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    InMemory,
    KafkaLike,
    RedisPubSub,
    DistributedPubSub,
}

/// Top-level configuration consumed by [`Registry::build`](crate::Registry::build).
///
/// ```
/// # use featurekit::{Config, Engine, EntityKind, Transport};
/// let config = Config::default()
///     .with_engine(EntityKind::Flags, Engine::RedisLike)
///     .with_transport(Transport::KafkaLike);
/// assert_eq!(config.engine_for(EntityKind::Flags), Engine::RedisLike);
/// assert_eq!(config.engine_for(EntityKind::Users), Engine::InMemory);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Prefix applied to every key, table or channel name shared with other deployments.
    pub namespace: String,
    /// Engine used by entity kinds that are not listed in `engines`.
    pub default_engine: Engine,
    pub engines: HashMap<EntityKind, Engine>,
    /// Engine of the variant event aggregator.
    pub aggregator_engine: AggregatorEngine,
    pub transport: Transport,
    pub bus: BusConfig,
    pub cache: CacheConfig,
    pub retry: RetryPolicy,
    pub sandbox: SandboxConfig,
    /// Number of documents fetched per round trip by prefix scans.
    pub page_size: usize,
    /// Directory of the level-db-like engine when the registry opens it itself.
    pub data_dir: Option<PathBuf>,
}

impl Config {
    pub const DEFAULT_NAMESPACE: &'static str = "featurekit";
    pub const DEFAULT_PAGE_SIZE: usize = 100;

    /// Engine configured for `kind`.
    pub fn engine_for(&self, kind: EntityKind) -> Engine {
        self.engines
            .get(&kind)
            .copied()
            .unwrap_or(self.default_engine)
    }

    pub fn with_engine(mut self, kind: EntityKind, engine: Engine) -> Config {
        self.engines.insert(kind, engine);
        self
    }

    pub fn with_default_engine(mut self, engine: Engine) -> Config {
        self.default_engine = engine;
        self
    }

    pub fn with_aggregator_engine(mut self, engine: impl Into<AggregatorEngine>) -> Config {
        self.aggregator_engine = engine.into();
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Config {
        self.transport = transport;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Config {
        self.namespace = namespace.into();
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Config {
        self.sandbox = sandbox;
        self
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            namespace: Config::DEFAULT_NAMESPACE.to_owned(),
            default_engine: Engine::InMemory,
            engines: HashMap::new(),
            aggregator_engine: AggregatorEngine::InMemory,
            transport: Transport::InMemory,
            bus: BusConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryPolicy::default(),
            sandbox: SandboxConfig::default(),
            page_size: Config::DEFAULT_PAGE_SIZE,
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BusConfig {
    /// Events buffered per subscriber before it is dropped as a slow consumer.
    pub subscriber_buffer: usize,
    /// Partitions of the kafka-like log. Events of one key always land in the same partition.
    pub partitions: u32,
    /// How long a log reader waits for new records before polling again.
    #[serde(with = "millis")]
    pub poll_wait: Duration,
}

impl BusConfig {
    pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;
    pub const DEFAULT_PARTITIONS: u32 = 8;
    pub const DEFAULT_POLL_WAIT: Duration = Duration::from_millis(500);
}

impl Default for BusConfig {
    fn default() -> BusConfig {
        BusConfig {
            subscriber_buffer: BusConfig::DEFAULT_SUBSCRIBER_BUFFER,
            partitions: BusConfig::DEFAULT_PARTITIONS,
            poll_wait: BusConfig::DEFAULT_POLL_WAIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Put a read-through cache in front of every store.
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig { enabled: true }
    }
}

/// Backoff applied to transient backend failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(2);

    /// A policy that never retries.
    pub fn none() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        }
    }

    /// Delay before retry number `attempt` (starting at 1): exponential, capped at `max_delay`,
    /// with up to 50% subtractive jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        use rand::{thread_rng, Rng};

        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let delay = exponential.min(self.max_delay);
        delay.saturating_sub(thread_rng().gen_range(Duration::ZERO..=delay / 2))
    }
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            max_attempts: RetryPolicy::DEFAULT_MAX_ATTEMPTS,
            base_delay: RetryPolicy::DEFAULT_BASE_DELAY,
            max_delay: RetryPolicy::DEFAULT_MAX_DELAY,
        }
    }
}

/// Limits of the script sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Wall-clock budget of one evaluation.
    #[serde(with = "millis")]
    pub timeout: Duration,
    /// Interpreter steps allowed per evaluation.
    pub max_operations: u64,
    pub max_call_depth: usize,
    /// Longest string or array a script may build.
    pub max_value_len: usize,
    /// Compiled scripts kept in memory.
    pub cache_capacity: usize,
    /// Hosts the scoped HTTP capability may reach. Empty allows any host.
    pub allowed_hosts: Vec<String>,
    #[serde(with = "millis")]
    pub http_timeout: Duration,
    /// Largest response body handed to a script.
    pub max_response_bytes: usize,
}

impl SandboxConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
    pub const DEFAULT_MAX_OPERATIONS: u64 = 100_000;
    pub const DEFAULT_MAX_CALL_DEPTH: usize = 64;
    pub const DEFAULT_MAX_VALUE_LEN: usize = 64 * 1024;
    pub const DEFAULT_CACHE_CAPACITY: usize = 1024;
    pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(2);
    pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 256 * 1024;

    pub fn with_timeout(mut self, timeout: Duration) -> SandboxConfig {
        self.timeout = timeout;
        self
    }

    pub fn with_max_operations(mut self, max_operations: u64) -> SandboxConfig {
        self.max_operations = max_operations;
        self
    }

    pub fn with_allowed_hosts(mut self, hosts: Vec<String>) -> SandboxConfig {
        self.allowed_hosts = hosts;
        self
    }
}

impl Default for SandboxConfig {
    fn default() -> SandboxConfig {
        SandboxConfig {
            timeout: SandboxConfig::DEFAULT_TIMEOUT,
            max_operations: SandboxConfig::DEFAULT_MAX_OPERATIONS,
            max_call_depth: SandboxConfig::DEFAULT_MAX_CALL_DEPTH,
            max_value_len: SandboxConfig::DEFAULT_MAX_VALUE_LEN,
            cache_capacity: SandboxConfig::DEFAULT_CACHE_CAPACITY,
            allowed_hosts: Vec::new(),
            http_timeout: SandboxConfig::DEFAULT_HTTP_TIMEOUT,
            max_response_bytes: SandboxConfig::DEFAULT_MAX_RESPONSE_BYTES,
        }
    }
}

/// Durations are written as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn parses_partial_configuration() {
        let config: Config = serde_json::from_str(
            r#"{
                "defaultEngine": "level-db-like",
                "engines": {"flags": "redis-like", "apikeys": "mongo-like"},
                "transport": "kafka-like",
                "aggregatorEngine": "distributed-log",
                "sandbox": {"timeout": 250}
            }"#,
        )
        .unwrap();

        assert_eq!(config.engine_for(EntityKind::Flags), Engine::RedisLike);
        assert_eq!(config.engine_for(EntityKind::ApiKeys), Engine::MongoLike);
        assert_eq!(config.engine_for(EntityKind::Scripts), Engine::LevelDbLike);
        assert_eq!(config.transport, Transport::KafkaLike);
        assert_eq!(config.aggregator_engine, AggregatorEngine::DistributedLog);
        assert_eq!(config.sandbox.timeout, Duration::from_millis(250));
        assert_eq!(
            config.sandbox.max_operations,
            SandboxConfig::DEFAULT_MAX_OPERATIONS
        );
        assert_eq!(config.namespace, Config::DEFAULT_NAMESPACE);
    }

    #[test]
    fn retry_delay_is_capped_and_jittered() {
        let policy = RetryPolicy::default();
        for attempt in 1..20 {
            let delay = policy.delay(attempt);
            assert!(delay <= policy.max_delay, "{delay:?} must be <= max delay");
        }
        let first = policy.delay(1);
        assert!(first <= policy.base_delay && first >= policy.base_delay / 2);
    }
}
