use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{conflict, Backend};
use crate::{
    driver::{DocumentCollection, DocumentDatabase, Filter},
    Document, Engine, Result,
};

/// Stored shape of a document.
#[derive(Serialize, Deserialize)]
struct StoredDocument {
    #[serde(rename = "_id")]
    id: String,
    value: Value,
    version: u64,
}

/// Mongo-like engine over the `{namespace}_documents` collection. Optimistic writes filter on the
/// `version` field.
pub struct DocumentDbBackend {
    collection: Arc<dyn DocumentCollection>,
}

impl DocumentDbBackend {
    pub fn new(database: &dyn DocumentDatabase, namespace: &str) -> DocumentDbBackend {
        DocumentDbBackend {
            collection: database.collection(&format!("{namespace}_documents")),
        }
    }
}

fn decode(stored: Value) -> Result<Document> {
    let stored: StoredDocument = serde_json::from_value(stored)?;
    Ok(Document::new(stored.id, stored.value, stored.version))
}

fn encode(document: &Document) -> Result<Value> {
    Ok(serde_json::to_value(StoredDocument {
        id: document.key.clone(),
        value: document.value.clone(),
        version: document.version,
    })?)
}

#[async_trait]
impl Backend for DocumentDbBackend {
    fn engine(&self) -> Engine {
        Engine::MongoLike
    }

    async fn fetch(&self, key: &str) -> Result<Option<Document>> {
        self.collection
            .find(&Filter::by_id(key), Some(1))
            .await?
            .into_iter()
            .next()
            .map(decode)
            .transpose()
    }

    async fn store(&self, document: &Document, expected: Option<u64>) -> Result<()> {
        let stored = encode(document)?;
        let written = match expected {
            None => self.collection.insert_one(stored).await?,
            Some(version) => {
                let filter = Filter::by_id(document.key.as_str()).field("version", version);
                self.collection.replace_one(&filter, stored).await?
            }
        };
        if !written {
            return Err(conflict(&document.key, expected, None));
        }
        Ok(())
    }

    async fn remove(&self, key: &str, expected: u64) -> Result<()> {
        let filter = Filter::by_id(key).field("version", expected);
        if !self.collection.delete_one(&filter).await? {
            return Err(conflict(key, Some(expected), None));
        }
        Ok(())
    }

    async fn scan(&self, prefix: &str, after: Option<&str>, limit: usize) -> Result<Vec<Document>> {
        let filter = Filter {
            id_prefix: Some(prefix.to_owned()),
            id_after: after.map(str::to_owned),
            ..Filter::default()
        };
        self.collection
            .find(&filter, Some(limit))
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDocumentDatabase;

    #[tokio::test]
    async fn conformance() {
        let backend = DocumentDbBackend::new(&MemoryDocumentDatabase::new(), "test");
        crate::store::tests::conformance(backend).await;
    }
}
