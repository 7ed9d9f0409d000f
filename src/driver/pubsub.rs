//! Fire-and-forget channel broker (Redis pub/sub, distributed pub/sub).
use std::collections::HashMap;

use async_trait::async_trait;
use futures::{future, stream::BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::Result;

const CHANNEL_CAPACITY: usize = 4096;

#[async_trait]
pub trait PubSubBroker: Send + Sync {
    /// Publish to every current subscriber of `channel`. Messages published while nobody listens
    /// are lost.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>>;
}

/// Embedded broker over tokio broadcast channels.
#[derive(Default)]
pub struct MemoryBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .lock()
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PubSubBroker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        // An error only means there are no subscribers.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>> {
        let channel = channel.to_owned();
        let receiver = self.sender(&channel).subscribe();
        Ok(BroadcastStream::new(receiver)
            .filter_map(move |message| {
                future::ready(match message {
                    Ok(payload) => Some(payload),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        log::warn!(
                            target: "featurekit",
                            channel,
                            skipped;
                            "pub/sub subscriber lagged, messages lost"
                        );
                        None
                    }
                })
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_every_subscriber() {
        let broker = MemoryBroker::new();
        broker.publish("c", b"lost".to_vec()).await.unwrap();

        let mut first = broker.subscribe("c").await.unwrap();
        let mut second = broker.subscribe("c").await.unwrap();
        broker.publish("c", b"hello".to_vec()).await.unwrap();

        assert_eq!(first.next().await, Some(b"hello".to_vec()));
        assert_eq!(second.next().await, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let broker = MemoryBroker::new();
        let mut other = broker.subscribe("other").await.unwrap();
        broker.publish("c", b"x".to_vec()).await.unwrap();
        broker.publish("other", b"y".to_vec()).await.unwrap();
        assert_eq!(other.next().await, Some(b"y".to_vec()));
    }
}
