//! Versioned document stores.
//!
//! [`VersionedDocumentStore`] is the capability every caller programs against. [`DocumentStore`]
//! implements it once on top of any engine adapter ([`Backend`]): it assigns versions, retries
//! transient failures and enqueues exactly one [`DomainEvent`](crate::DomainEvent) per successful
//! mutation. The read-through [`CachedStore`](crate::cache::CachedStore) implements the same
//! capability on top of another store.
use std::ops::Bound;

use async_trait::async_trait;
use futures::{
    stream::{self, BoxStream},
    StreamExt, TryStreamExt,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{model, Config, Document, Engine, EntityKind, Error, Result};

mod document_db;
mod document_store;
mod kv;
mod log_structured;
mod memory;
mod outbox;
mod search_index;
mod wide_column;

pub use document_db::DocumentDbBackend;
pub use document_store::DocumentStore;
pub use kv::KvBackend;
pub use log_structured::LogStructuredBackend;
pub use memory::MemoryBackend;
pub use outbox::{event_queue, EventOutbox, EventQueue};
pub use search_index::SearchIndexBackend;
pub use wide_column::WideColumnBackend;

/// Restart point of a prefix scan: the key of the last document returned.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Resume a scan after `key`.
    pub fn after(key: impl Into<String>) -> Cursor {
        Cursor(key.into())
    }

    pub fn key(&self) -> &str {
        &self.0
    }
}

/// One page of a prefix scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub documents: Vec<Document>,
    /// Cursor of the next page, `None` once the scan is exhausted.
    pub next: Option<Cursor>,
}

impl Page {
    /// Build a page from up to `limit` documents sorted by key.
    pub(crate) fn from_sorted(documents: Vec<Document>, limit: usize) -> Page {
        let next = match documents.last() {
            Some(last) if documents.len() >= limit => Some(Cursor::after(last.key.clone())),
            _ => None,
        };
        Page { documents, next }
    }
}

/// Lazy sequence of documents returned by
/// [`find_by_prefix`](VersionedDocumentStore::find_by_prefix).
pub type DocumentStream<'a> = BoxStream<'a, Result<Document>>;

/// Outcome of [`bulk_import`](VersionedDocumentStore::bulk_import).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub imported: usize,
    pub failures: Vec<ImportFailure>,
}

impl ImportReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A record rejected by a bulk import.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportFailure {
    /// Position of the record in the imported batch.
    pub index: usize,
    pub key: Option<String>,
    pub reason: String,
}

/// Backend-agnostic CRUD and paginated prefix queries over the documents of one entity kind.
#[async_trait]
pub trait VersionedDocumentStore: Send + Sync {
    fn entity_kind(&self) -> EntityKind;

    /// Page size used by [`find_by_prefix`](VersionedDocumentStore::find_by_prefix).
    fn page_size(&self) -> usize {
        Config::DEFAULT_PAGE_SIZE
    }

    /// Fetch `key`, failing with [`Error::NotFound`] if it is absent.
    async fn get(&self, key: &str) -> Result<Document>;

    /// Create or overwrite `key`. The returned document carries the new version.
    async fn put(&self, key: &str, value: Value) -> Result<Document>;

    /// Overwrite `key` only if its current version is `expected_version`. Fails with
    /// [`Error::ConflictOnWrite`] otherwise, leaving the refetch to the caller.
    async fn update(&self, key: &str, expected_version: u64, value: Value) -> Result<Document>;

    /// Delete `key`, failing with [`Error::NotFound`] if it is absent.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Up to `limit` documents whose keys start with `prefix` and sort after `cursor`, in key
    /// order.
    async fn page(&self, prefix: &str, cursor: Option<&Cursor>, limit: usize) -> Result<Page>;

    /// Every document under `prefix` in key order, fetched page by page.
    ///
    /// The stream never yields a key twice and never skips a key that stays unmodified for the
    /// whole scan. Restart it after a failure by passing the key of the last document received as
    /// `cursor`.
    fn find_by_prefix<'a>(&'a self, prefix: &'a str, cursor: Option<Cursor>) -> DocumentStream<'a> {
        let limit = self.page_size().max(1);
        stream::try_unfold(Some(cursor), move |state| async move {
            let Some(cursor) = state else {
                return Ok::<_, Error>(None);
            };
            let page = self.page(prefix, cursor.as_ref(), limit).await?;
            Ok(Some((page.documents, page.next.map(Some))))
        })
        .map_ok(|documents| stream::iter(documents.into_iter().map(Ok::<_, Error>)))
        .try_flatten()
        .boxed()
    }

    async fn count(&self, prefix: &str) -> Result<u64> {
        self.find_by_prefix(prefix, None)
            .try_fold(0, |count, _| async move { Ok(count + 1) })
            .await
    }

    /// Apply `records` one at a time.
    ///
    /// A record is either `{"key": "<kind>/<id>", "value": ...}` or `{"id": "<id>", "value": ...}`.
    /// Each value is validated against the model of the entity kind. A bad record never aborts the
    /// batch; it is reported in [`ImportReport::failures`].
    async fn bulk_import(&self, records: Vec<Value>) -> ImportReport {
        let kind = self.entity_kind();
        let mut report = ImportReport::default();
        for (index, record) in records.into_iter().enumerate() {
            let outcome = match import_record(kind, record) {
                Ok((key, value)) => match self.put(&key, value).await {
                    Ok(_) => Ok(()),
                    Err(err) => Err((Some(key), err.to_string())),
                },
                Err(rejected) => Err(rejected),
            };
            match outcome {
                Ok(()) => report.imported += 1,
                Err((key, reason)) => {
                    log::warn!(
                        target: "featurekit",
                        entity_kind = kind.namespace(),
                        index,
                        reason = reason.as_str();
                        "rejected imported record"
                    );
                    report.failures.push(ImportFailure { index, key, reason });
                }
            }
        }
        log::info!(
            target: "featurekit",
            entity_kind = kind.namespace(),
            imported = report.imported,
            failed = report.failures.len();
            "bulk import finished"
        );
        report
    }
}

fn import_record(
    kind: EntityKind,
    record: Value,
) -> std::result::Result<(String, Value), (Option<String>, String)> {
    let Value::Object(mut record) = record else {
        return Err((None, "record is not an object".to_owned()));
    };
    let key = match (record.get("key"), record.get("id")) {
        (Some(Value::String(key)), _) => key.clone(),
        (None, Some(Value::String(id))) => kind.key(id),
        _ => return Err((None, "record has neither a string `key` nor `id`".to_owned())),
    };
    kind.validate_key(&key)
        .map_err(|err| (Some(key.clone()), err.to_string()))?;
    let Some(value) = record.remove("value") else {
        return Err((Some(key), "record has no `value`".to_owned()));
    };
    model::validate(kind, &value).map_err(|reason| (Some(key.clone()), reason))?;
    Ok((key, value))
}

/// Engine adapter SPI: the primitive operations a storage engine provides to [`DocumentStore`].
///
/// Versions are assigned by the caller. Conditional operations compare the stored version with
/// `expected` (`None` meaning absent) atomically with the write and fail with
/// [`Error::ConflictOnWrite`] on mismatch.
#[async_trait]
pub trait Backend: Send + Sync {
    fn engine(&self) -> Engine;

    async fn fetch(&self, key: &str) -> Result<Option<Document>>;

    async fn store(&self, document: &Document, expected: Option<u64>) -> Result<()>;

    async fn remove(&self, key: &str, expected: u64) -> Result<()>;

    /// Up to `limit` documents under `prefix` sorting strictly after `after`, in key order.
    async fn scan(&self, prefix: &str, after: Option<&str>, limit: usize) -> Result<Vec<Document>>;
}

pub(crate) fn conflict(key: &str, expected: Option<u64>, found: Option<u64>) -> Error {
    Error::ConflictOnWrite {
        key: key.to_owned(),
        expected,
        found,
    }
}

/// Lower bound of a scan of `prefix` resuming after `after`.
pub(crate) fn scan_start<'a>(prefix: &'a str, after: Option<&'a str>) -> Bound<&'a str> {
    match after {
        Some(after) if after >= prefix => Bound::Excluded(after),
        _ => Bound::Included(prefix),
    }
}

/// Whether `key` falls in a scan of `prefix` resuming after `after`.
pub(crate) fn in_scan(key: &str, prefix: &str, after: Option<&str>) -> bool {
    key.starts_with(prefix) && after.map_or(true, |after| key > after)
}

#[cfg(test)]
pub(crate) mod tests {
    //! Conformance suite run against every engine adapter.
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{config::RetryPolicy, DomainEventKind};

    pub(crate) async fn store_over(
        backend: impl Backend + 'static,
    ) -> (Arc<DocumentStore>, EventOutbox) {
        let (queue, outbox) = event_queue();
        let store = DocumentStore::new(EntityKind::Flags, Box::new(backend), queue)
            .with_retry(RetryPolicy::none())
            .with_page_size(2);
        (Arc::new(store), outbox)
    }

    pub(crate) async fn conformance(backend: impl Backend + 'static) {
        let (store, mut outbox) = store_over(backend).await;

        // Monotonic versions, including across delete and re-create.
        let first = store.put("flags/a", json!({"n": 1})).await.unwrap();
        let second = store.put("flags/a", json!({"n": 2})).await.unwrap();
        assert!(second.version > first.version);
        assert_eq!(store.get("flags/a").await.unwrap(), second);
        store.delete("flags/a").await.unwrap();
        assert!(matches!(
            store.get("flags/a").await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            store.delete("flags/a").await,
            Err(Error::NotFound { .. })
        ));
        let third = store.put("flags/a", json!({"n": 3})).await.unwrap();
        assert!(third.version > second.version);

        // One event per mutation, in mutation order.
        let kinds: Vec<_> = std::iter::from_fn(|| outbox.try_next())
            .map(|event| event.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                DomainEventKind::Created,
                DomainEventKind::Updated,
                DomainEventKind::Deleted,
                DomainEventKind::Created
            ]
        );

        // Optimistic updates.
        assert!(matches!(
            store.update("flags/a", third.version + 1, json!({})).await,
            Err(Error::ConflictOnWrite { .. })
        ));
        let fourth = store
            .update("flags/a", third.version, json!({"n": 4}))
            .await
            .unwrap();
        assert!(fourth.version > third.version);
        assert!(matches!(
            store.update("flags/missing", 1, json!({})).await,
            Err(Error::NotFound { .. })
        ));

        // Prefix scans in key order across pages, without siblings of the prefix.
        for key in ["flags/team/c", "flags/team/a", "flags/teams", "flags/team/b", "flags/z"] {
            store.put(key, json!({})).await.unwrap();
        }
        let keys: Vec<_> = store
            .find_by_prefix("flags/team/", None)
            .map_ok(|doc| doc.key)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(keys, vec!["flags/team/a", "flags/team/b", "flags/team/c"]);

        let resumed: Vec<_> = store
            .find_by_prefix("flags/", Some(Cursor::after("flags/team/b")))
            .map_ok(|doc| doc.key)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(resumed, vec!["flags/team/c", "flags/teams", "flags/z"]);
        assert_eq!(store.count("flags/").await.unwrap(), 6);

        // Keys outside the namespace are rejected.
        assert!(matches!(
            store.put("scripts/x", json!({})).await,
            Err(Error::InvalidKey { .. })
        ));
    }

    #[tokio::test]
    async fn memory_conformance() {
        conformance(MemoryBackend::new()).await;
    }

    #[tokio::test]
    async fn bulk_import_reports_bad_records() {
        let (queue, _outbox) = event_queue();
        let store =
            DocumentStore::new(EntityKind::Experiments, Box::new(MemoryBackend::new()), queue);
        let variants = json!([{"id": "A", "traffic": 50}, {"id": "B", "traffic": 50}]);
        let report = store
            .bulk_import(vec![
                json!({
                    "id": "e1",
                    "value": {"id": "e1", "name": "E1", "enabled": true, "variants": variants}
                }),
                json!({
                    "key": "experiments/e2",
                    "value": {"id": "e2", "enabled": true, "variants": [{"id": "A", "traffic": 10}]}
                }),
                json!({"key": "flags/x", "value": {}}),
                json!("not a record"),
                json!({"id": "e3"}),
            ])
            .await;
        assert_eq!(report.imported, 1);
        let failed: Vec<_> = report.failures.iter().map(|f| f.index).collect();
        assert_eq!(failed, vec![1, 2, 3, 4]);
        assert!(store.get("experiments/e1").await.is_ok());
    }

    #[tokio::test]
    async fn scans_tolerate_concurrent_writes() {
        let (store, _outbox) = store_over(MemoryBackend::new()).await;
        for i in 0..10 {
            store.put(&format!("flags/k{i}"), json!(i)).await.unwrap();
        }
        let mut scan = store.find_by_prefix("flags/", None);
        let mut seen = Vec::new();
        while let Some(doc) = scan.try_next().await.unwrap() {
            if seen.is_empty() {
                store.put("flags/a-new", json!({})).await.unwrap();
                store.delete("flags/k9").await.unwrap();
            }
            seen.push(doc.key);
        }
        for i in 0..9 {
            assert!(seen.contains(&format!("flags/k{i}")));
        }
        let mut deduped = seen.clone();
        deduped.dedup();
        assert_eq!(seen, deduped);
    }
}
