//! Event bus fanning domain events out to subscribers.
//!
//! Delivery is at-least-once and ordered per key only. Every subscriber owns a bounded buffer; a
//! subscriber whose buffer is full is dropped and its stream ends with [`SlowConsumer`], so a
//! stalled consumer never slows down publishers.
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{DomainEvent, EntityKind, Result};

mod fanout;
mod local;
mod partitioned;
mod pubsub;

pub use local::LocalBus;
pub use partitioned::LogBus;
pub use pubsub::PubSubBus;

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish `event` to every matching subscriber.
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    /// Subscribe to events matching `filter`, published from now on.
    fn subscribe(&self, filter: EventFilter) -> Subscription;
}

/// Selects the events a subscriber receives. The default filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub kinds: Option<BTreeSet<EntityKind>>,
    pub key_prefix: Option<String>,
}

impl EventFilter {
    pub fn all() -> EventFilter {
        EventFilter::default()
    }

    pub fn kinds(kinds: impl IntoIterator<Item = EntityKind>) -> EventFilter {
        EventFilter {
            kinds: Some(kinds.into_iter().collect()),
            key_prefix: None,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> EventFilter {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn matches(&self, event: &DomainEvent) -> bool {
        self.kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&event.entity_kind))
            && self
                .key_prefix
                .as_deref()
                .map_or(true, |prefix| event.key.starts_with(prefix))
    }
}

/// The subscriber fell behind and was dropped by the bus. Events published after the drop are
/// not delivered; resubscribe and resynchronize from the stores.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("subscriber fell behind and was dropped")]
pub struct SlowConsumer;

/// Stream of the events of one subscriber.
///
/// Ends with a single `Err(SlowConsumer)` if the subscriber was dropped for falling behind, and
/// without error when the bus shuts down.
pub struct Subscription {
    receiver: mpsc::Receiver<DomainEvent>,
    dropped: Arc<AtomicBool>,
    finished: bool,
}

impl Subscription {
    pub(crate) fn new(
        receiver: mpsc::Receiver<DomainEvent>,
        dropped: Arc<AtomicBool>,
    ) -> Subscription {
        Subscription {
            receiver,
            dropped,
            finished: false,
        }
    }
}

impl Stream for Subscription {
    type Item = std::result::Result<DomainEvent, SlowConsumer>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(None) => {
                self.finished = true;
                if self.dropped.load(Ordering::Acquire) {
                    Poll::Ready(Some(Err(SlowConsumer)))
                } else {
                    Poll::Ready(None)
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Drops redelivered events: an event is new if its version is above every version seen for its
/// key, which covers both duplicates and stale replays.
///
/// At most `capacity` keys are remembered. Past that the key first seen longest ago is forgotten,
/// and a late redelivery for it passes as new. Consumers must tolerate that, as cache
/// invalidation and idempotent aggregation do.
#[derive(Debug)]
pub struct Deduplicator {
    seen: HashMap<String, u64>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Default for Deduplicator {
    fn default() -> Deduplicator {
        Deduplicator::with_capacity(Deduplicator::DEFAULT_CAPACITY)
    }
}

impl Deduplicator {
    pub const DEFAULT_CAPACITY: usize = 65_536;

    pub fn new() -> Deduplicator {
        Deduplicator::default()
    }

    pub fn with_capacity(capacity: usize) -> Deduplicator {
        Deduplicator {
            seen: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record `event` and return `true` if it was not seen before.
    pub fn first_delivery(&mut self, event: &DomainEvent) -> bool {
        match self.seen.get_mut(&event.key) {
            Some(version) if *version >= event.version => false,
            Some(version) => {
                *version = event.version;
                true
            }
            None => {
                self.seen.insert(event.key.clone(), event.version);
                self.order.push_back(event.key.clone());
                while self.seen.len() > self.capacity {
                    match self.order.pop_front() {
                        Some(oldest) => self.seen.remove(&oldest),
                        None => break,
                    };
                }
                true
            }
        }
    }

    /// Number of keys remembered.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Forget everything, e.g. after a resubscription.
    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::DomainEventKind;

    pub(crate) fn event(key: &str, version: u64) -> DomainEvent {
        DomainEvent {
            kind: DomainEventKind::Updated,
            key: key.to_owned(),
            entity_kind: EntityKind::of_key(key).unwrap_or(EntityKind::Flags),
            old_value: None,
            new_value: Some(json!({"version": version})),
            version,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn filters_by_kind_and_prefix() {
        let filter = EventFilter::kinds([EntityKind::Flags]).with_key_prefix("flags/team/");
        assert!(filter.matches(&event("flags/team/a", 1)));
        assert!(!filter.matches(&event("flags/other", 1)));
        assert!(!filter.matches(&event("scripts/team/a", 1)));
        assert!(EventFilter::all().matches(&event("scripts/x", 1)));
    }

    #[test]
    fn deduplicates_by_key_and_version() {
        let mut dedup = Deduplicator::new();
        assert!(dedup.first_delivery(&event("flags/a", 1)));
        assert!(!dedup.first_delivery(&event("flags/a", 1)));
        assert!(dedup.first_delivery(&event("flags/b", 1)));
        assert!(dedup.first_delivery(&event("flags/a", 2)));
        assert!(!dedup.first_delivery(&event("flags/a", 1)));
    }

    #[test]
    fn deduplicator_forgets_oldest_keys_beyond_capacity() {
        let mut dedup = Deduplicator::with_capacity(2);
        for n in 1..=3 {
            assert!(dedup.first_delivery(&event(&format!("experiment-events/e/A/{n}"), 1)));
        }
        assert_eq!(dedup.len(), 2);
        assert!(!dedup.first_delivery(&event("experiment-events/e/A/3", 1)));
        assert!(dedup.first_delivery(&event("experiment-events/e/A/1", 1)));
        assert_eq!(dedup.len(), 2);

        for n in 0..10_000 {
            dedup.first_delivery(&event(&format!("experiment-events/e/B/{n}"), 1));
        }
        assert_eq!(dedup.len(), 2);
        dedup.clear();
        assert!(dedup.is_empty());
    }
}
