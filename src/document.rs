//! Documents, entity kinds and the domain events emitted by store mutations.
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Separator of hierarchical key segments.
pub const KEY_SEPARATOR: char = '/';

/// A JSON value stored under a hierarchical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: String,
    pub value: serde_json::Value,
    /// Strictly increases on every successful write of `key`.
    pub version: u64,
}

impl Document {
    pub fn new(key: impl Into<String>, value: serde_json::Value, version: u64) -> Document {
        Document {
            key: key.into(),
            value,
            version,
        }
    }

    /// Deserialize the value into a typed model.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.value).map_err(|err| Error::InvalidDocument {
            key: self.key.clone(),
            reason: err.to_string(),
        })
    }
}

/// Kinds of entities the service persists. Each kind owns the key namespace `<kind>/...` and is
/// stored independently of the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Flags,
    Configs,
    Experiments,
    ExperimentEvents,
    Webhooks,
    Users,
    #[serde(rename = "apikeys")]
    ApiKeys,
    Scripts,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Flags,
        EntityKind::Configs,
        EntityKind::Experiments,
        EntityKind::ExperimentEvents,
        EntityKind::Webhooks,
        EntityKind::Users,
        EntityKind::ApiKeys,
        EntityKind::Scripts,
    ];

    /// First key segment of every document of this kind.
    pub fn namespace(self) -> &'static str {
        match self {
            EntityKind::Flags => "flags",
            EntityKind::Configs => "configs",
            EntityKind::Experiments => "experiments",
            EntityKind::ExperimentEvents => "experiment-events",
            EntityKind::Webhooks => "webhooks",
            EntityKind::Users => "users",
            EntityKind::ApiKeys => "apikeys",
            EntityKind::Scripts => "scripts",
        }
    }

    /// Build the document key of the entity `id`.
    pub fn key(self, id: &str) -> String {
        format!("{}{KEY_SEPARATOR}{id}", self.namespace())
    }

    /// Listing prefix covering every document of this kind.
    pub fn prefix(self) -> String {
        format!("{}{KEY_SEPARATOR}", self.namespace())
    }

    /// Entity id of `key`, i.e. the key without its namespace segment.
    pub fn id_of<'a>(self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.namespace())?
            .strip_prefix(KEY_SEPARATOR)
            .filter(|id| !id.is_empty())
    }

    /// Entity kind owning `key`.
    pub fn of_key(key: &str) -> Option<EntityKind> {
        let namespace = key.split(KEY_SEPARATOR).next()?;
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.namespace() == namespace)
    }

    /// Check that `key` is a well-formed key of this kind.
    pub fn validate_key(self, key: &str) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidKey {
            key: key.to_owned(),
            reason: reason.to_owned(),
        };
        let id = self
            .id_of(key)
            .ok_or_else(|| invalid(&format!("expected {}/<id>", self.namespace())))?;
        if id.split(KEY_SEPARATOR).any(str::is_empty) {
            return Err(invalid("empty key segment"));
        }
        Ok(())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

/// Every ancestor listing prefix of `key`, shortest first.
///
/// `flags/team/beta` yields `flags/` and `flags/team/`.
pub fn ancestor_prefixes(key: &str) -> impl Iterator<Item = &str> {
    key.match_indices(KEY_SEPARATOR)
        .map(move |(index, _)| &key[..=index])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainEventKind {
    Created,
    Updated,
    Deleted,
}

/// A committed mutation of a stored entity.
///
/// Emitted exactly once per successful store mutation. `(key, version)` identifies the event and
/// is used by subscribers to drop duplicate deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub kind: DomainEventKind,
    pub key: String,
    pub entity_kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<serde_json::Value>,
    /// Version written by the mutation. For deletions, the tombstone version.
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    pub(crate) fn written(
        entity_kind: EntityKind,
        previous: Option<Document>,
        current: &Document,
    ) -> Self {
        DomainEvent {
            kind: if previous.is_some() {
                DomainEventKind::Updated
            } else {
                DomainEventKind::Created
            },
            key: current.key.clone(),
            entity_kind,
            old_value: previous.map(|doc| doc.value),
            new_value: Some(current.value.clone()),
            version: current.version,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn deleted(entity_kind: EntityKind, previous: Document, tombstone: u64) -> Self {
        DomainEvent {
            kind: DomainEventKind::Deleted,
            key: previous.key,
            entity_kind,
            old_value: Some(previous.value),
            new_value: None,
            version: tombstone,
            timestamp: Utc::now(),
        }
    }

    /// Document carried by a `Created` or `Updated` event.
    pub fn document(&self) -> Option<Document> {
        self.new_value
            .as_ref()
            .map(|value| Document::new(self.key.clone(), value.clone(), self.version))
    }
}
