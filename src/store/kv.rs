use std::sync::Arc;

use async_trait::async_trait;

use super::{conflict, in_scan, Backend};
use crate::{
    driver::{escape_glob, KvConnection},
    Document, Engine, Result,
};

/// Redis-like engine. Each document is one JSON string under `{namespace}:doc:{key}`; writes are
/// compare-and-set on the stored string.
pub struct KvBackend {
    connection: Arc<dyn KvConnection>,
    namespace: String,
}

impl KvBackend {
    pub fn new(connection: Arc<dyn KvConnection>, namespace: &str) -> KvBackend {
        KvBackend {
            connection,
            namespace: format!("{namespace}:doc:"),
        }
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{key}", self.namespace)
    }

    async fn fetch_raw(&self, key: &str) -> Result<Option<(String, Document)>> {
        let Some(raw) = self.connection.get(&self.redis_key(key)).await? else {
            return Ok(None);
        };
        let document = serde_json::from_str(&raw)?;
        Ok(Some((raw, document)))
    }
}

#[async_trait]
impl Backend for KvBackend {
    fn engine(&self) -> Engine {
        Engine::RedisLike
    }

    async fn fetch(&self, key: &str) -> Result<Option<Document>> {
        Ok(self.fetch_raw(key).await?.map(|(_, document)| document))
    }

    async fn store(&self, document: &Document, expected: Option<u64>) -> Result<()> {
        let current = self.fetch_raw(&document.key).await?;
        let found = current.as_ref().map(|(_, doc)| doc.version);
        if found != expected {
            return Err(conflict(&document.key, expected, found));
        }
        let value = serde_json::to_string(document)?;
        let raw = current.as_ref().map(|(raw, _)| raw.as_str());
        if !self
            .connection
            .set_if(&self.redis_key(&document.key), raw, Some(&value))
            .await?
        {
            return Err(conflict(&document.key, expected, None));
        }
        Ok(())
    }

    async fn remove(&self, key: &str, expected: u64) -> Result<()> {
        let current = self.fetch_raw(key).await?;
        let found = current.as_ref().map(|(_, doc)| doc.version);
        let Some((raw, _)) = current.filter(|_| found == Some(expected)) else {
            return Err(conflict(key, Some(expected), found));
        };
        if !self
            .connection
            .set_if(&self.redis_key(key), Some(&raw), None)
            .await?
        {
            return Err(conflict(key, Some(expected), None));
        }
        Ok(())
    }

    /// `SCAN` is unordered, so every page matches the whole prefix and sorts client-side.
    async fn scan(&self, prefix: &str, after: Option<&str>, limit: usize) -> Result<Vec<Document>> {
        let pattern = format!("{}*", escape_glob(&self.redis_key(prefix)));
        let mut keys: Vec<String> = self
            .connection
            .scan(&pattern)
            .await?
            .into_iter()
            .filter_map(|redis_key| {
                redis_key
                    .strip_prefix(&self.namespace)
                    .map(str::to_owned)
            })
            .filter(|key| in_scan(key, prefix, after))
            .collect();
        keys.sort_unstable();

        let mut documents = Vec::with_capacity(limit.min(keys.len()));
        for key in keys {
            if documents.len() >= limit {
                break;
            }
            // Keys deleted since the scan are skipped.
            if let Some(document) = self.fetch(&key).await? {
                documents.push(document);
            }
        }
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryKv;

    #[tokio::test]
    async fn conformance() {
        let backend = KvBackend::new(Arc::new(MemoryKv::new()), "test");
        crate::store::tests::conformance(backend).await;
    }

    #[tokio::test]
    async fn ignores_other_namespaces() {
        let kv: Arc<dyn KvConnection> = Arc::new(MemoryKv::new());
        let ours = KvBackend::new(kv.clone(), "a");
        let theirs = KvBackend::new(kv, "ab");
        theirs
            .store(&Document::new("flags/x", serde_json::json!(1), 1), None)
            .await
            .unwrap();
        assert!(ours.scan("flags/", None, 10).await.unwrap().is_empty());
    }
}
