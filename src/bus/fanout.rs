//! Delivery of events to the local subscribers of a bus.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::{EventFilter, Subscription};
use crate::DomainEvent;

struct Slot {
    filter: EventFilter,
    sender: mpsc::Sender<DomainEvent>,
    dropped: Arc<AtomicBool>,
}

/// Bounded per-subscriber buffers. Delivery never waits: a full buffer drops its subscriber.
pub(crate) struct Fanout {
    slots: Mutex<Vec<Slot>>,
    buffer: usize,
}

impl Fanout {
    pub(crate) fn new(buffer: usize) -> Fanout {
        Fanout {
            slots: Mutex::new(Vec::new()),
            buffer: buffer.max(1),
        }
    }

    pub(crate) fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let dropped = Arc::new(AtomicBool::new(false));
        self.slots.lock().push(Slot {
            filter,
            sender,
            dropped: dropped.clone(),
        });
        Subscription::new(receiver, dropped)
    }

    pub(crate) fn deliver(&self, event: &DomainEvent) {
        self.slots.lock().retain(|slot| {
            if !slot.filter.matches(event) {
                return !slot.sender.is_closed();
            }
            match slot.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    slot.dropped.store(true, Ordering::Release);
                    log::warn!(
                        target: "featurekit",
                        key = event.key.as_str(),
                        version = event.version;
                        "dropping slow event subscriber"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    pub(crate) fn subscribers(&self) -> usize {
        self.slots.lock().len()
    }

    /// End every subscription without error.
    pub(crate) fn close(&self) {
        self.slots.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::{bus::tests::event, bus::SlowConsumer};

    #[tokio::test]
    async fn drops_full_subscribers_only() {
        let fanout = Fanout::new(2);
        let mut slow = fanout.subscribe(EventFilter::all());
        let mut fast = fanout.subscribe(EventFilter::all());

        for version in 1..=3 {
            fanout.deliver(&event("flags/a", version));
            if version < 3 {
                assert_eq!(fast.next().await.unwrap().unwrap().version, version);
            }
        }
        assert_eq!(fast.next().await.unwrap().unwrap().version, 3);
        assert_eq!(fanout.subscribers(), 1);

        assert_eq!(slow.next().await.unwrap().unwrap().version, 1);
        assert_eq!(slow.next().await.unwrap().unwrap().version, 2);
        assert_eq!(slow.next().await, Some(Err(SlowConsumer)));
        assert_eq!(slow.next().await, None);
    }

    #[tokio::test]
    async fn forgets_cancelled_subscribers() {
        let fanout = Fanout::new(2);
        let subscription = fanout.subscribe(EventFilter::kinds([crate::EntityKind::Scripts]));
        drop(subscription);
        fanout.deliver(&event("flags/a", 1));
        assert_eq!(fanout.subscribers(), 0);
    }

    #[tokio::test]
    async fn close_ends_streams_cleanly() {
        let fanout = Fanout::new(2);
        let mut subscription = fanout.subscribe(EventFilter::all());
        fanout.close();
        assert_eq!(subscription.next().await, None);
    }
}
