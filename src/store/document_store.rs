use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{Backend, Cursor, EventQueue, Page, VersionedDocumentStore};
use crate::{
    config::RetryPolicy,
    sharder::{Md5Sharder, Sharder},
    Config, Document, DomainEvent, Engine, EntityKind, Error, Result,
};

const LOCK_STRIPES: u64 = 64;

/// Issues versions that increase per key and never repeat within the store, even when a key is
/// deleted and created again: `max(previous + 1, last issued + 1, now in microseconds)`.
#[derive(Debug, Default)]
struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    fn next(&self, previous: Option<u64>) -> u64 {
        let floor = previous.map_or(0, |version| version.saturating_add(1));
        let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
        let step = |last: u64| floor.max(last.saturating_add(1)).max(now);
        let last = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(step(last)))
            .unwrap_or_else(|last| last);
        step(last)
    }
}

/// [`VersionedDocumentStore`] of one entity kind over an engine adapter.
///
/// Mutations of the same key are serialized by a striped async lock, held until the resulting
/// event is queued. Transient backend failures are retried with [`RetryPolicy`].
pub struct DocumentStore {
    kind: EntityKind,
    backend: Box<dyn Backend>,
    events: EventQueue,
    retry: RetryPolicy,
    clock: VersionClock,
    stripes: Vec<Mutex<()>>,
    page_size: usize,
}

impl DocumentStore {
    pub fn new(kind: EntityKind, backend: Box<dyn Backend>, events: EventQueue) -> DocumentStore {
        DocumentStore {
            kind,
            backend,
            events,
            retry: RetryPolicy::default(),
            clock: VersionClock::default(),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            page_size: Config::DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> DocumentStore {
        self.retry = retry;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> DocumentStore {
        self.page_size = page_size.max(1);
        self
    }

    pub fn engine(&self) -> Engine {
        self.backend.engine()
    }

    fn stripe(&self, key: &str) -> &Mutex<()> {
        &self.stripes[Md5Sharder.get_shard(key, LOCK_STRIPES) as usize]
    }

    async fn retrying<T, F, Fut>(&self, key: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    log::warn!(
                        target: "featurekit",
                        engine:% = self.engine(),
                        key,
                        attempt,
                        error:% = err;
                        "backend operation failed, retrying"
                    );
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn fetch(&self, key: &str) -> Result<Option<Document>> {
        self.retrying(key, || self.backend.fetch(key)).await
    }

    /// Conditionally store `document`, resolving an ambiguous outcome: a retried write that
    /// reports a conflict may have been applied by an earlier attempt.
    async fn store(&self, document: &Document, expected: Option<u64>) -> Result<()> {
        match self
            .retrying(&document.key, || self.backend.store(document, expected))
            .await
        {
            Err(Error::ConflictOnWrite { .. }) => {
                match self.fetch(&document.key).await? {
                    Some(current) if current.version == document.version => Ok(()),
                    current => Err(Error::ConflictOnWrite {
                        key: document.key.clone(),
                        expected,
                        found: current.map(|doc| doc.version),
                    }),
                }
            }
            result => result,
        }
    }

    fn check_key(&self, key: &str) -> Result<()> {
        self.kind.validate_key(key)
    }
}

#[async_trait]
impl VersionedDocumentStore for DocumentStore {
    fn entity_kind(&self) -> EntityKind {
        self.kind
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    async fn get(&self, key: &str) -> Result<Document> {
        self.fetch(key).await?.ok_or_else(|| Error::not_found(key))
    }

    async fn put(&self, key: &str, value: Value) -> Result<Document> {
        self.check_key(key)?;
        let _guard = self.stripe(key).lock().await;
        loop {
            let previous = self.fetch(key).await?;
            let expected = previous.as_ref().map(|doc| doc.version);
            let document = Document::new(key, value.clone(), self.clock.next(expected));
            match self.store(&document, expected).await {
                Ok(()) => {
                    self.events
                        .enqueue(DomainEvent::written(self.kind, previous, &document));
                    return Ok(document);
                }
                // Another writer sharing the backend got in between: refetch and try again.
                Err(Error::ConflictOnWrite { .. }) => {
                    log::debug!(target: "featurekit", key; "concurrent write detected, refetching");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn update(&self, key: &str, expected_version: u64, value: Value) -> Result<Document> {
        self.check_key(key)?;
        let _guard = self.stripe(key).lock().await;
        let previous = self.fetch(key).await?.ok_or_else(|| Error::not_found(key))?;
        if previous.version != expected_version {
            return Err(Error::ConflictOnWrite {
                key: key.to_owned(),
                expected: Some(expected_version),
                found: Some(previous.version),
            });
        }
        let document = Document::new(key, value, self.clock.next(Some(previous.version)));
        self.store(&document, Some(previous.version)).await?;
        self.events
            .enqueue(DomainEvent::written(self.kind, Some(previous), &document));
        Ok(document)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_key(key)?;
        let _guard = self.stripe(key).lock().await;
        loop {
            let previous = self.fetch(key).await?.ok_or_else(|| Error::not_found(key))?;
            let removed = self
                .retrying(key, || self.backend.remove(key, previous.version))
                .await;
            match removed {
                Ok(()) => {
                    let tombstone = self.clock.next(Some(previous.version));
                    self.events
                        .enqueue(DomainEvent::deleted(self.kind, previous, tombstone));
                    return Ok(());
                }
                // Either another writer changed the key or an earlier attempt already removed it;
                // the refetch tells which.
                Err(Error::ConflictOnWrite { .. }) => {
                    if self.fetch(key).await?.is_none() {
                        let tombstone = self.clock.next(Some(previous.version));
                        self.events
                            .enqueue(DomainEvent::deleted(self.kind, previous, tombstone));
                        return Ok(());
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn page(&self, prefix: &str, cursor: Option<&Cursor>, limit: usize) -> Result<Page> {
        let after = cursor.map(Cursor::key);
        let documents = self
            .retrying(prefix, || self.backend.scan(prefix, after, limit))
            .await?;
        Ok(Page::from_sorted(documents, limit))
    }
}
