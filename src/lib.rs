//! Feature flags, A/B experiments and dynamic configuration over pluggable storage engines.
//!
//! # Overview
//!
//! Service state (flags, experiments, configs, webhooks, users, api keys and scripts) is kept as
//! versioned JSON [`Document`]s under hierarchical `/`-separated keys. Every entity kind can live
//! on a different engine (in-memory, redis-like, cassandra-like, dynamo-like, elastic-like,
//! level-db-like or mongo-like); callers only ever see the uniform
//! [`VersionedDocumentStore`](store::VersionedDocumentStore) contract.
//!
//! Every successful mutation emits exactly one [`DomainEvent`] on the [`EventBus`](bus::EventBus).
//! Subscribers keep the read-through [caches](cache::CachedStore) fresh and feed exposure and
//! conversion events to the [aggregator](aggregator::VariantEventAggregator) that backs
//! experiment results.
//!
//! Flags may delegate their decision to operator-authored scripts, evaluated per request by the
//! [`ScriptSandbox`](script::ScriptSandbox) with a bounded time, operation and memory budget.
//!
//! The [`Registry`] builds and wires every component from a [`Config`] and the infrastructure
//! [`Drivers`].
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Script faults never fail a request: a flag whose
//! script fails is reported inactive, and the fault is logged.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with structured key-values,
//! under the `featurekit` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into background tasks.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod adapter;
pub mod aggregator;
pub mod bus;
pub mod cache;
pub mod config;
pub mod driver;
pub mod experiment;
pub mod feature;
pub mod model;
pub mod script;
pub mod store;

mod document;
mod error;
mod registry;
mod sharder;

pub use config::{AggregatorEngine, Config, Engine, Transport};
pub use document::{
    ancestor_prefixes, Document, DomainEvent, DomainEventKind, EntityKind, KEY_SEPARATOR,
};
pub use driver::Drivers;
pub use error::{Error, Result};
pub use registry::Registry;
