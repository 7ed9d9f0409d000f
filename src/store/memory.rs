use std::{collections::BTreeMap, ops::Bound};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{conflict, scan_start, Backend};
use crate::{Document, Engine, Result};

/// In-process engine over a sorted map.
#[derive(Default)]
pub struct MemoryBackend {
    documents: RwLock<BTreeMap<String, Document>>,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn engine(&self) -> Engine {
        Engine::InMemory
    }

    async fn fetch(&self, key: &str) -> Result<Option<Document>> {
        Ok(self.documents.read().get(key).cloned())
    }

    async fn store(&self, document: &Document, expected: Option<u64>) -> Result<()> {
        let mut documents = self.documents.write();
        let found = documents.get(&document.key).map(|doc| doc.version);
        if found != expected {
            return Err(conflict(&document.key, expected, found));
        }
        documents.insert(document.key.clone(), document.clone());
        Ok(())
    }

    async fn remove(&self, key: &str, expected: u64) -> Result<()> {
        let mut documents = self.documents.write();
        let found = documents.get(key).map(|doc| doc.version);
        if found != Some(expected) {
            return Err(conflict(key, Some(expected), found));
        }
        documents.remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str, after: Option<&str>, limit: usize) -> Result<Vec<Document>> {
        Ok(self
            .documents
            .read()
            .range::<str, _>((scan_start(prefix, after), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(limit)
            .map(|(_, doc)| doc.clone())
            .collect())
    }
}
