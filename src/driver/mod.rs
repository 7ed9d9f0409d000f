//! Narrow client interfaces of the infrastructure the engines talk to.
//!
//! Each engine adapter reaches its infrastructure through one of these traits instead of a
//! concrete driver. Every trait comes with an embedded in-process implementation that is used by
//! tests and by single-node deployments; production deployments hand their own implementations
//! to [`Drivers`].
use std::sync::Arc;

use crate::{script::HttpCapability, Result};

mod document;
mod event_log;
mod kv;
mod pubsub;
mod search;
mod wide_column;

pub use document::{
    DocumentCollection, DocumentDatabase, Filter, MemoryDocumentDatabase, ID_FIELD,
};
pub use event_log::{EventLog, LogRecord, MemoryEventLog};
pub(crate) use kv::escape_glob;
pub use kv::{KvConnection, MemoryKv};
pub use pubsub::{MemoryBroker, PubSubBroker};
pub use search::{Hit, MemorySearchIndex, SearchIndex, SearchQuery, WriteCondition};
pub use wide_column::{LightweightCondition, MemoryWideColumn, Row, WideColumnSession};

/// Infrastructure handles available to the [`Registry`](crate::Registry).
///
/// A handle left as `None` makes every engine or transport that needs it a configuration error at
/// startup.
#[derive(Clone, Default)]
pub struct Drivers {
    pub kv: Option<Arc<dyn KvConnection>>,
    pub wide_column: Option<Arc<dyn WideColumnSession>>,
    pub documents: Option<Arc<dyn DocumentDatabase>>,
    pub search: Option<Arc<dyn SearchIndex>>,
    pub sled: Option<sled::Db>,
    pub event_log: Option<Arc<dyn EventLog>>,
    pub broker: Option<Arc<dyn PubSubBroker>>,
    /// Outbound HTTP used by scripts. Defaults to a scoped `reqwest` client.
    pub http: Option<Arc<dyn HttpCapability>>,
}

impl Drivers {
    /// No infrastructure at all: only the in-memory engine and transport are usable.
    pub fn none() -> Drivers {
        Drivers::default()
    }

    /// Embedded implementations of every driver, including a temporary `sled` database.
    pub fn embedded() -> Result<Drivers> {
        Ok(Drivers {
            kv: Some(Arc::new(MemoryKv::new())),
            wide_column: Some(Arc::new(MemoryWideColumn::new())),
            documents: Some(Arc::new(MemoryDocumentDatabase::new())),
            search: Some(Arc::new(MemorySearchIndex::new())),
            sled: Some(sled::Config::new().temporary(true).open()?),
            event_log: Some(Arc::new(MemoryEventLog::new())),
            broker: Some(Arc::new(MemoryBroker::new())),
            http: None,
        })
    }

    pub fn with_http(mut self, http: Arc<dyn HttpCapability>) -> Drivers {
        self.http = Some(http);
        self
    }
}
