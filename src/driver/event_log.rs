//! Partitioned append-only log interface (Kafka-like).
use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub offset: u64,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append a record and return its offset.
    async fn append(&self, topic: &str, partition: u32, payload: Vec<u8>) -> Result<u64>;

    /// Offset the next appended record will get.
    async fn end_offset(&self, topic: &str, partition: u32) -> Result<u64>;

    /// Up to `max` records starting at offset `from`. Waits up to `wait` when none is available
    /// yet, returning an empty batch on expiry.
    async fn poll(
        &self,
        topic: &str,
        partition: u32,
        from: u64,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<LogRecord>>;
}

/// Embedded event log. Records are kept forever.
#[derive(Default)]
pub struct MemoryEventLog {
    partitions: Mutex<HashMap<(String, u32), Vec<Vec<u8>>>>,
    appended: Notify,
}

impl MemoryEventLog {
    pub fn new() -> MemoryEventLog {
        MemoryEventLog::default()
    }

    fn read(&self, topic: &str, partition: u32, from: u64, max: usize) -> Vec<LogRecord> {
        let partitions = self.partitions.lock();
        let Some(records) = partitions.get(&(topic.to_owned(), partition)) else {
            return Vec::new();
        };
        records
            .iter()
            .enumerate()
            .skip(from as usize)
            .take(max)
            .map(|(offset, payload)| LogRecord {
                offset: offset as u64,
                payload: payload.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, topic: &str, partition: u32, payload: Vec<u8>) -> Result<u64> {
        let offset = {
            let mut partitions = self.partitions.lock();
            let records = partitions
                .entry((topic.to_owned(), partition))
                .or_default();
            records.push(payload);
            records.len() as u64 - 1
        };
        self.appended.notify_waiters();
        Ok(offset)
    }

    async fn end_offset(&self, topic: &str, partition: u32) -> Result<u64> {
        Ok(self
            .partitions
            .lock()
            .get(&(topic.to_owned(), partition))
            .map_or(0, |records| records.len() as u64))
    }

    async fn poll(
        &self,
        topic: &str,
        partition: u32,
        from: u64,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<LogRecord>> {
        // Register interest before reading so an append in between still wakes us up.
        let mut notified = std::pin::pin!(self.appended.notified());
        notified.as_mut().enable();

        let records = self.read(topic, partition, from, max);
        if !records.is_empty() || wait.is_zero() {
            return Ok(records);
        }
        let _ = tokio::time::timeout(wait, notified).await;
        Ok(self.read(topic, partition, from, max))
    }
}
