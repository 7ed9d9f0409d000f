use std::ops::Bound;

use async_trait::async_trait;

use super::{conflict, scan_start, Backend};
use crate::{Document, Engine, Result};

/// LevelDB-like engine over a local `sled` tree named `{namespace}/documents`. Keys are stored as
/// is, so sled's byte order is key order.
pub struct LogStructuredBackend {
    tree: sled::Tree,
}

impl LogStructuredBackend {
    pub fn open(db: &sled::Db, namespace: &str) -> Result<LogStructuredBackend> {
        Ok(LogStructuredBackend {
            tree: db.open_tree(format!("{namespace}/documents"))?,
        })
    }

    fn fetch_raw(&self, key: &str) -> Result<Option<(sled::IVec, Document)>> {
        let Some(raw) = self.tree.get(key)? else {
            return Ok(None);
        };
        let document = serde_json::from_slice(&raw)?;
        Ok(Some((raw, document)))
    }
}

#[async_trait]
impl Backend for LogStructuredBackend {
    fn engine(&self) -> Engine {
        Engine::LevelDbLike
    }

    async fn fetch(&self, key: &str) -> Result<Option<Document>> {
        Ok(self.fetch_raw(key)?.map(|(_, document)| document))
    }

    async fn store(&self, document: &Document, expected: Option<u64>) -> Result<()> {
        let current = self.fetch_raw(&document.key)?;
        let found = current.as_ref().map(|(_, doc)| doc.version);
        if found != expected {
            return Err(conflict(&document.key, expected, found));
        }
        let value = serde_json::to_vec(document)?;
        self.tree
            .compare_and_swap(
                document.key.as_bytes(),
                current.map(|(raw, _)| raw),
                Some(value),
            )?
            .map_err(|_| conflict(&document.key, expected, None))
    }

    async fn remove(&self, key: &str, expected: u64) -> Result<()> {
        let current = self.fetch_raw(key)?;
        let found = current.as_ref().map(|(_, doc)| doc.version);
        let Some((raw, _)) = current.filter(|_| found == Some(expected)) else {
            return Err(conflict(key, Some(expected), found));
        };
        self.tree
            .compare_and_swap(key.as_bytes(), Some(raw), None as Option<&[u8]>)?
            .map_err(|_| conflict(key, Some(expected), None))
    }

    async fn scan(&self, prefix: &str, after: Option<&str>, limit: usize) -> Result<Vec<Document>> {
        let start = scan_start(prefix, after).map(str::as_bytes);
        let mut documents = Vec::new();
        for entry in self.tree.range::<&[u8], _>((start, Bound::Unbounded)) {
            let (key, raw) = entry?;
            if !key.starts_with(prefix.as_bytes()) || documents.len() >= limit {
                break;
            }
            documents.push(serde_json::from_slice(&raw)?);
        }
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conformance() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let backend = LogStructuredBackend::open(&db, "test").unwrap();
        crate::store::tests::conformance(backend).await;
    }

    #[tokio::test]
    async fn survives_reopening() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let backend = LogStructuredBackend::open(&db, "test").unwrap();
        backend
            .store(&Document::new("flags/a", serde_json::json!(1), 7), None)
            .await
            .unwrap();
        drop(backend);

        let reopened = LogStructuredBackend::open(&db, "test").unwrap();
        assert_eq!(reopened.fetch("flags/a").await.unwrap().unwrap().version, 7);
    }
}
