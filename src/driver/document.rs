//! Document database interface (Mongo-like).
use std::{collections::BTreeMap, collections::HashMap, ops::Bound, sync::Arc};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::Result;

/// Field name of the primary key of every stored document.
pub const ID_FIELD: &str = "_id";

/// A conjunction of conditions on `_id` and top-level fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub id: Option<String>,
    /// `_id` starts with this prefix (an anchored regex on `_id`).
    pub id_prefix: Option<String>,
    /// `_id` sorts strictly after this value (`$gt`).
    pub id_after: Option<String>,
    /// Top-level fields equal to the given values.
    pub fields: Vec<(String, Value)>,
}

impl Filter {
    pub fn by_id(id: impl Into<String>) -> Filter {
        Filter {
            id: Some(id.into()),
            ..Filter::default()
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Filter {
        self.fields.push((name.into(), value.into()));
        self
    }

    fn matches(&self, id: &str, document: &Value) -> bool {
        self.id.as_deref().map_or(true, |expected| expected == id)
            && self
                .id_prefix
                .as_deref()
                .map_or(true, |prefix| id.starts_with(prefix))
            && self.id_after.as_deref().map_or(true, |after| id > after)
            && self
                .fields
                .iter()
                .all(|(name, value)| document.get(name) == Some(value))
    }
}

#[async_trait]
pub trait DocumentCollection: Send + Sync {
    /// Documents matching `filter`, sorted by `_id`.
    async fn find(&self, filter: &Filter, limit: Option<usize>) -> Result<Vec<Value>>;

    /// Insert a document carrying an `_id`. Returns `false` on duplicate key.
    async fn insert_one(&self, document: Value) -> Result<bool>;

    /// Replace the first document matching `filter`. Returns `false` when nothing matched.
    async fn replace_one(&self, filter: &Filter, document: Value) -> Result<bool>;

    async fn delete_one(&self, filter: &Filter) -> Result<bool>;

    async fn count(&self, filter: &Filter) -> Result<u64>;
}

pub trait DocumentDatabase: Send + Sync {
    fn collection(&self, name: &str) -> Arc<dyn DocumentCollection>;
}

/// Embedded document database.
#[derive(Default)]
pub struct MemoryDocumentDatabase {
    collections: Mutex<HashMap<String, Arc<MemoryCollection>>>,
}

impl MemoryDocumentDatabase {
    pub fn new() -> MemoryDocumentDatabase {
        MemoryDocumentDatabase::default()
    }
}

impl DocumentDatabase for MemoryDocumentDatabase {
    fn collection(&self, name: &str) -> Arc<dyn DocumentCollection> {
        self.collections
            .lock()
            .entry(name.to_owned())
            .or_default()
            .clone()
    }
}

#[derive(Default)]
struct MemoryCollection {
    documents: RwLock<BTreeMap<String, Value>>,
}

impl MemoryCollection {
    fn matching<'a>(
        documents: &'a BTreeMap<String, Value>,
        filter: &'a Filter,
    ) -> impl Iterator<Item = (&'a String, &'a Value)> {
        let start = match (&filter.id, &filter.id_prefix) {
            (Some(id), _) => Bound::Included(id.as_str()),
            (None, Some(prefix)) => Bound::Included(prefix.as_str()),
            (None, None) => Bound::Unbounded,
        };
        documents
            .range::<str, _>((start, Bound::Unbounded))
            .take_while(move |(id, _)| {
                filter.id.as_deref().map_or(true, |expected| *id == expected)
                    && filter
                        .id_prefix
                        .as_deref()
                        .map_or(true, |prefix| id.starts_with(prefix))
            })
            .filter(move |(id, document)| filter.matches(id, document))
    }
}

#[async_trait]
impl DocumentCollection for MemoryCollection {
    async fn find(&self, filter: &Filter, limit: Option<usize>) -> Result<Vec<Value>> {
        let documents = self.documents.read();
        Ok(MemoryCollection::matching(&documents, filter)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(_, document)| document.clone())
            .collect())
    }

    async fn insert_one(&self, document: Value) -> Result<bool> {
        let Some(id) = document.get(ID_FIELD).and_then(Value::as_str) else {
            return Ok(false);
        };
        let mut documents = self.documents.write();
        if documents.contains_key(id) {
            return Ok(false);
        }
        documents.insert(id.to_owned(), document);
        Ok(true)
    }

    async fn replace_one(&self, filter: &Filter, document: Value) -> Result<bool> {
        let mut documents = self.documents.write();
        let Some(id) = MemoryCollection::matching(&documents, filter)
            .map(|(id, _)| id.clone())
            .next()
        else {
            return Ok(false);
        };
        documents.insert(id, document);
        Ok(true)
    }

    async fn delete_one(&self, filter: &Filter) -> Result<bool> {
        let mut documents = self.documents.write();
        let Some(id) = MemoryCollection::matching(&documents, filter)
            .map(|(id, _)| id.clone())
            .next()
        else {
            return Ok(false);
        };
        documents.remove(&id);
        Ok(true)
    }

    async fn count(&self, filter: &Filter) -> Result<u64> {
        let documents = self.documents.read();
        Ok(MemoryCollection::matching(&documents, filter).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn filters_by_prefix_and_fields() {
        let db = MemoryDocumentDatabase::new();
        let events = db.collection("events");
        for (id, experiment) in [("b/1", "b"), ("a/2", "a"), ("a/1", "a"), ("ab/1", "ab")] {
            assert!(events
                .insert_one(json!({"_id": id, "experimentId": experiment}))
                .await
                .unwrap());
        }
        assert!(!events.insert_one(json!({"_id": "a/1"})).await.unwrap());

        let filter = Filter {
            id_prefix: Some("a/".into()),
            ..Filter::default()
        };
        let found = events.find(&filter, None).await.unwrap();
        let ids: Vec<_> = found.iter().map(|d| d[ID_FIELD].clone()).collect();
        assert_eq!(ids, vec![json!("a/1"), json!("a/2")]);

        let filter = Filter::default().field("experimentId", "ab");
        assert_eq!(events.count(&filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn replaces_only_matching_versions() {
        let db = MemoryDocumentDatabase::new();
        let docs = db.collection("docs");
        docs.insert_one(json!({"_id": "k", "version": 1}))
            .await
            .unwrap();

        let stale = Filter::by_id("k").field("version", 2);
        assert!(!docs
            .replace_one(&stale, json!({"_id": "k", "version": 3}))
            .await
            .unwrap());

        let current = Filter::by_id("k").field("version", 1);
        assert!(docs
            .replace_one(&current, json!({"_id": "k", "version": 3}))
            .await
            .unwrap());
        assert!(docs.delete_one(&Filter::by_id("k")).await.unwrap());
        assert_eq!(docs.count(&Filter::default()).await.unwrap(), 0);
    }
}
