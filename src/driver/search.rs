//! Search index interface (Elastic-like).
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::Result;

/// A stored document as returned by the index.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: String,
    pub source: Value,
    /// Sequence number assigned by the index on every write (`_seq_no`).
    pub seq_no: u64,
}

/// Optimistic concurrency control of an index request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// `op_type=create`: fail if the id exists.
    Create,
    /// `if_seq_no`: fail unless the stored hit has this sequence number.
    IfSeqNo(u64),
}

/// A search sorted by `_id`, paginated with `search_after`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    pub id_prefix: Option<String>,
    pub search_after: Option<String>,
    /// `term` filters on top-level fields of the source.
    pub terms: Vec<(String, Value)>,
    pub size: usize,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn get(&self, index: &str, id: &str) -> Result<Option<Hit>>;

    /// Index `source` under `id`. Returns `false` on a version conflict.
    async fn index(
        &self,
        index: &str,
        id: &str,
        source: Value,
        condition: WriteCondition,
    ) -> Result<bool>;

    /// Delete `id` if its sequence number is `seq_no`.
    async fn delete(&self, index: &str, id: &str, seq_no: u64) -> Result<bool>;

    async fn search(&self, index: &str, query: &SearchQuery) -> Result<Vec<Hit>>;

    /// Document counts of a `terms` aggregation over `group_by` fields, restricted to documents
    /// matching `terms`. Keys hold the group field values in `group_by` order.
    async fn count_by(
        &self,
        index: &str,
        terms: &[(String, Value)],
        group_by: &[&str],
    ) -> Result<HashMap<Vec<String>, u64>>;
}

/// Embedded search index.
#[derive(Default)]
pub struct MemorySearchIndex {
    indices: RwLock<HashMap<String, BTreeMap<String, Hit>>>,
    seq_no: std::sync::atomic::AtomicU64,
}

impl MemorySearchIndex {
    pub fn new() -> MemorySearchIndex {
        MemorySearchIndex::default()
    }

    fn next_seq_no(&self) -> u64 {
        self.seq_no
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1
    }
}

fn matches_terms(source: &Value, terms: &[(String, Value)]) -> bool {
    terms
        .iter()
        .all(|(field, value)| source.get(field) == Some(value))
}

fn term_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn get(&self, index: &str, id: &str) -> Result<Option<Hit>> {
        Ok(self
            .indices
            .read()
            .get(index)
            .and_then(|hits| hits.get(id))
            .cloned())
    }

    async fn index(
        &self,
        index: &str,
        id: &str,
        source: Value,
        condition: WriteCondition,
    ) -> Result<bool> {
        let mut indices = self.indices.write();
        let hits = indices.entry(index.to_owned()).or_default();
        let allowed = match (condition, hits.get(id)) {
            (WriteCondition::Create, None) => true,
            (WriteCondition::IfSeqNo(seq_no), Some(hit)) => hit.seq_no == seq_no,
            _ => false,
        };
        if allowed {
            let seq_no = self.next_seq_no();
            hits.insert(
                id.to_owned(),
                Hit {
                    id: id.to_owned(),
                    source,
                    seq_no,
                },
            );
        }
        Ok(allowed)
    }

    async fn delete(&self, index: &str, id: &str, seq_no: u64) -> Result<bool> {
        let mut indices = self.indices.write();
        let Some(hits) = indices.get_mut(index) else {
            return Ok(false);
        };
        if hits.get(id).map(|hit| hit.seq_no) != Some(seq_no) {
            return Ok(false);
        }
        hits.remove(id);
        Ok(true)
    }

    async fn search(&self, index: &str, query: &SearchQuery) -> Result<Vec<Hit>> {
        let indices = self.indices.read();
        let Some(hits) = indices.get(index) else {
            return Ok(Vec::new());
        };
        Ok(hits
            .values()
            .filter(|hit| {
                query
                    .id_prefix
                    .as_deref()
                    .map_or(true, |prefix| hit.id.starts_with(prefix))
            })
            .filter(|hit| {
                query
                    .search_after
                    .as_deref()
                    .map_or(true, |after| hit.id.as_str() > after)
            })
            .filter(|hit| matches_terms(&hit.source, &query.terms))
            .take(query.size)
            .cloned()
            .collect())
    }

    async fn count_by(
        &self,
        index: &str,
        terms: &[(String, Value)],
        group_by: &[&str],
    ) -> Result<HashMap<Vec<String>, u64>> {
        let indices = self.indices.read();
        let mut buckets = HashMap::new();
        for hit in indices.get(index).into_iter().flat_map(BTreeMap::values) {
            if !matches_terms(&hit.source, terms) {
                continue;
            }
            let key = group_by
                .iter()
                .map(|field| term_string(hit.source.get(*field)))
                .collect();
            *buckets.entry(key).or_insert(0) += 1;
        }
        Ok(buckets)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn sequence_numbers_guard_writes() {
        let index = MemorySearchIndex::new();
        assert!(index
            .index("i", "a", json!({"n": 1}), WriteCondition::Create)
            .await
            .unwrap());
        let hit = index.get("i", "a").await.unwrap().unwrap();
        assert!(!index
            .index("i", "a", json!({"n": 2}), WriteCondition::Create)
            .await
            .unwrap());
        assert!(index
            .index("i", "a", json!({"n": 2}), WriteCondition::IfSeqNo(hit.seq_no))
            .await
            .unwrap());
        assert!(!index.delete("i", "a", hit.seq_no).await.unwrap());
    }

    #[tokio::test]
    async fn aggregates_terms() {
        let index = MemorySearchIndex::new();
        for (id, variant, kind) in [
            ("1", "A", "Displayed"),
            ("2", "A", "Won"),
            ("3", "B", "Displayed"),
            ("4", "A", "Displayed"),
        ] {
            index
                .index(
                    "events",
                    id,
                    json!({"experimentId": "e", "variantId": variant, "kind": kind}),
                    WriteCondition::Create,
                )
                .await
                .unwrap();
        }
        let buckets = index
            .count_by(
                "events",
                &[("experimentId".to_owned(), json!("e"))],
                &["variantId", "kind"],
            )
            .await
            .unwrap();
        assert_eq!(buckets[&vec!["A".to_owned(), "Displayed".to_owned()]], 2);
        assert_eq!(buckets[&vec!["A".to_owned(), "Won".to_owned()]], 1);
        assert_eq!(buckets[&vec!["B".to_owned(), "Displayed".to_owned()]], 1);
    }
}
