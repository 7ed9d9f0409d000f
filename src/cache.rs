//! Read-through cache in front of a document store.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::{
    adapter::{adapter_for, CacheInvalidationEvent, CacheKey},
    ancestor_prefixes,
    bus::{Deduplicator, EventBus, EventFilter},
    store::{Cursor, Page, VersionedDocumentStore},
    Document, EntityKind, Result,
};

/// Caches documents and prefix listings of another store, populated on read misses and
/// invalidated by domain events and by its own writes.
///
/// Every invalidation bumps a generation counter. A read that raced with an invalidation removes
/// what it just inserted, so a stale value never outlives the invalidation that covered it.
pub struct CachedStore {
    inner: Arc<dyn VersionedDocumentStore>,
    documents: DashMap<String, Document>,
    listings: DashMap<String, Arc<Vec<Document>>>,
    generation: AtomicU64,
}

impl CachedStore {
    pub fn new(inner: Arc<dyn VersionedDocumentStore>) -> CachedStore {
        CachedStore {
            inner,
            documents: DashMap::new(),
            listings: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// All documents under `prefix`, in key order. Cached as a whole.
    pub async fn list(&self, prefix: &str) -> Result<Arc<Vec<Document>>> {
        if let Some(listing) = self.listings.get(prefix) {
            return Ok(listing.clone());
        }
        let generation = self.generation.load(Ordering::Acquire);
        let listing: Arc<Vec<Document>> = Arc::new(
            self.inner
                .find_by_prefix(prefix, None)
                .try_collect()
                .await?,
        );
        self.listings.insert(prefix.to_owned(), listing.clone());
        if self.generation.load(Ordering::Acquire) != generation {
            self.listings
                .remove_if(prefix, |_, cached| Arc::ptr_eq(cached, &listing));
        }
        Ok(listing)
    }

    pub fn invalidate(&self, invalidation: &CacheInvalidationEvent) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        for key in &invalidation.affected_keys {
            match key {
                CacheKey::Document(key) => {
                    self.documents.remove(key);
                }
                CacheKey::Listing(prefix) => {
                    self.listings.remove(prefix);
                }
            }
        }
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.documents.clear();
        self.listings.clear();
    }

    pub fn cached_documents(&self) -> usize {
        self.documents.len()
    }

    fn invalidate_written(&self, key: &str) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.documents.remove(key);
        for prefix in ancestor_prefixes(key) {
            self.listings.remove(prefix);
        }
    }

    /// Apply the invalidations of every event of this store's entity kind published on `bus`.
    ///
    /// When the subscription is dropped for falling behind, the cache is cleared and a new
    /// subscription is taken, since any event may have been missed.
    pub fn spawn_invalidation(self: Arc<Self>, bus: Arc<dyn EventBus>) -> JoinHandle<()> {
        let filter = EventFilter::kinds([self.entity_kind()]);
        let mut subscription = bus.subscribe(filter.clone());
        tokio::spawn(async move {
            let mut deduplicator = Deduplicator::new();
            loop {
                let mut lagged = false;
                while let Some(delivery) = subscription.next().await {
                    match delivery {
                        Ok(event) => {
                            if !deduplicator.first_delivery(&event) {
                                continue;
                            }
                            for invalidation in adapter_for(event.entity_kind).invalidations(&event)
                            {
                                self.invalidate(&invalidation);
                            }
                        }
                        Err(err) => {
                            log::warn!(
                                target: "featurekit",
                                entity_kind = self.entity_kind().namespace(),
                                error:% = err;
                                "cache invalidation lagged, clearing cache"
                            );
                            lagged = true;
                        }
                    }
                }
                if !lagged {
                    log::debug!(
                        target: "featurekit",
                        entity_kind = self.entity_kind().namespace();
                        "event bus closed, stopping cache invalidation"
                    );
                    return;
                }
                subscription = bus.subscribe(filter.clone());
                deduplicator.clear();
                self.clear();
            }
        })
    }
}

#[async_trait]
impl VersionedDocumentStore for CachedStore {
    fn entity_kind(&self) -> EntityKind {
        self.inner.entity_kind()
    }

    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    async fn get(&self, key: &str) -> Result<Document> {
        if let Some(document) = self.documents.get(key) {
            return Ok(document.clone());
        }
        let generation = self.generation.load(Ordering::Acquire);
        let document = self.inner.get(key).await?;
        self.documents.insert(key.to_owned(), document.clone());
        if self.generation.load(Ordering::Acquire) != generation {
            self.documents
                .remove_if(key, |_, cached| cached.version == document.version);
        }
        Ok(document)
    }

    async fn put(&self, key: &str, value: Value) -> Result<Document> {
        let written = self.inner.put(key, value).await;
        self.invalidate_written(key);
        written
    }

    async fn update(&self, key: &str, expected_version: u64, value: Value) -> Result<Document> {
        let written = self.inner.update(key, expected_version, value).await;
        self.invalidate_written(key);
        written
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let deleted = self.inner.delete(key).await;
        self.invalidate_written(key);
        deleted
    }

    async fn page(&self, prefix: &str, cursor: Option<&Cursor>, limit: usize) -> Result<Page> {
        self.inner.page(prefix, cursor, limit).await
    }

    async fn count(&self, prefix: &str) -> Result<u64> {
        Ok(self.list(prefix).await?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        bus::LocalBus,
        config::RetryPolicy,
        store::{event_queue, DocumentStore, MemoryBackend},
    };

    struct Fixture {
        upstream: Arc<DocumentStore>,
        cache: Arc<CachedStore>,
        _tasks: Vec<JoinHandle<()>>,
    }

    /// A cache whose upstream store is also written behind its back, as another instance would.
    fn fixture() -> Fixture {
        let bus: Arc<dyn EventBus> = Arc::new(LocalBus::new(64));
        let (queue, outbox) = event_queue();
        let upstream = Arc::new(DocumentStore::new(
            EntityKind::Flags,
            Box::new(MemoryBackend::new()),
            queue,
        ));
        let cache = Arc::new(CachedStore::new(upstream.clone()));
        let tasks = vec![
            outbox.spawn(bus.clone(), RetryPolicy::none()),
            cache.clone().spawn_invalidation(bus),
        ];
        Fixture {
            upstream,
            cache,
            _tasks: tasks,
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn serves_reads_from_cache() {
        let fixture = fixture();
        fixture.upstream.put("flags/a", json!(1)).await.unwrap();
        let first = fixture.cache.get("flags/a").await.unwrap();
        assert_eq!(fixture.cache.cached_documents(), 1);
        assert_eq!(fixture.cache.get("flags/a").await.unwrap(), first);
    }

    #[tokio::test]
    async fn upstream_writes_invalidate_through_the_bus() {
        let fixture = fixture();
        fixture.upstream.put("flags/team/a", json!(1)).await.unwrap();
        assert_eq!(fixture.cache.get("flags/team/a").await.unwrap().value, json!(1));
        assert_eq!(fixture.cache.list("flags/team/").await.unwrap().len(), 1);

        fixture.upstream.put("flags/team/a", json!(2)).await.unwrap();
        fixture.upstream.put("flags/team/b", json!(3)).await.unwrap();
        let cache = fixture.cache.clone();
        eventually(move || cache.cached_documents() == 0).await;

        assert_eq!(fixture.cache.get("flags/team/a").await.unwrap().value, json!(2));
        assert_eq!(fixture.cache.list("flags/team/").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn own_writes_are_visible_immediately() {
        let fixture = fixture();
        fixture.cache.put("flags/a", json!(1)).await.unwrap();
        assert_eq!(fixture.cache.list("flags/").await.unwrap().len(), 1);
        fixture.cache.get("flags/a").await.unwrap();

        fixture.cache.put("flags/a", json!(2)).await.unwrap();
        fixture.cache.put("flags/b", json!(3)).await.unwrap();
        assert_eq!(fixture.cache.get("flags/a").await.unwrap().value, json!(2));
        assert_eq!(fixture.cache.count("flags/").await.unwrap(), 2);

        fixture.cache.delete("flags/a").await.unwrap();
        assert!(fixture.cache.get("flags/a").await.is_err());
    }

    #[tokio::test]
    async fn clears_after_falling_behind() {
        let bus: Arc<dyn EventBus> = Arc::new(LocalBus::new(1));
        let (queue, _outbox) = event_queue();
        let upstream = Arc::new(DocumentStore::new(
            EntityKind::Flags,
            Box::new(MemoryBackend::new()),
            queue,
        ));
        let cache = Arc::new(CachedStore::new(upstream.clone()));
        let _task = cache.clone().spawn_invalidation(bus.clone());

        upstream.put("flags/a", json!(1)).await.unwrap();
        cache.get("flags/a").await.unwrap();
        // Overflow the single-slot buffer before the invalidation task runs.
        for version in 1..=3 {
            bus.publish(crate::bus::tests::event("flags/other", version))
                .await
                .unwrap();
        }
        let watched = cache.clone();
        eventually(move || watched.cached_documents() == 0).await;
    }
}
