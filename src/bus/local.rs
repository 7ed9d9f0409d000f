use async_trait::async_trait;

use super::{fanout::Fanout, EventBus, EventFilter, Subscription};
use crate::{DomainEvent, Result};

/// In-process transport: publishing delivers straight into the subscriber buffers.
pub struct LocalBus {
    fanout: Fanout,
}

impl LocalBus {
    pub fn new(subscriber_buffer: usize) -> LocalBus {
        LocalBus {
            fanout: Fanout::new(subscriber_buffer),
        }
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.fanout.deliver(&event);
        Ok(())
    }

    fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.fanout.subscribe(filter)
    }
}

impl Drop for LocalBus {
    fn drop(&mut self) {
        self.fanout.close();
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::{bus::tests::event, EntityKind};

    #[tokio::test]
    async fn delivers_matching_events_in_order() {
        let bus = LocalBus::new(16);
        let mut flags = bus.subscribe(EventFilter::kinds([EntityKind::Flags]));
        let mut everything = bus.subscribe(EventFilter::all());

        bus.publish(event("scripts/s", 1)).await.unwrap();
        for version in 1..=3 {
            bus.publish(event("flags/a", version)).await.unwrap();
        }

        for version in 1..=3 {
            assert_eq!(flags.next().await.unwrap().unwrap().version, version);
        }
        assert_eq!(everything.next().await.unwrap().unwrap().key, "scripts/s");
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_publisher() {
        let bus = LocalBus::new(1);
        let mut stalled = bus.subscribe(EventFilter::all());
        for version in 1..=100 {
            bus.publish(event("flags/a", version)).await.unwrap();
        }
        assert!(stalled.next().await.unwrap().is_ok());
        assert!(stalled.next().await.unwrap().is_err());
    }
}
