use std::sync::Arc;

use async_trait::async_trait;

use super::{conflict, Backend};
use crate::{
    driver::{Hit, SearchIndex, SearchQuery, WriteCondition},
    Document, Engine, Result,
};

/// Elastic-like engine over the `{namespace}-documents` index. The document id is the key;
/// optimistic writes go through the index sequence numbers.
pub struct SearchIndexBackend {
    index: Arc<dyn SearchIndex>,
    name: String,
}

impl SearchIndexBackend {
    pub fn new(index: Arc<dyn SearchIndex>, namespace: &str) -> SearchIndexBackend {
        SearchIndexBackend {
            index,
            // Index names must be lowercase.
            name: format!("{}-documents", namespace.to_lowercase()),
        }
    }

    async fn hit(&self, key: &str) -> Result<Option<(Hit, Document)>> {
        let Some(hit) = self.index.get(&self.name, key).await? else {
            return Ok(None);
        };
        let document = serde_json::from_value(hit.source.clone())?;
        Ok(Some((hit, document)))
    }
}

#[async_trait]
impl Backend for SearchIndexBackend {
    fn engine(&self) -> Engine {
        Engine::ElasticLike
    }

    async fn fetch(&self, key: &str) -> Result<Option<Document>> {
        Ok(self.hit(key).await?.map(|(_, document)| document))
    }

    async fn store(&self, document: &Document, expected: Option<u64>) -> Result<()> {
        let current = self.hit(&document.key).await?;
        let found = current.as_ref().map(|(_, doc)| doc.version);
        if found != expected {
            return Err(conflict(&document.key, expected, found));
        }
        let condition = match current {
            Some((hit, _)) => WriteCondition::IfSeqNo(hit.seq_no),
            None => WriteCondition::Create,
        };
        let source = serde_json::to_value(document)?;
        if !self
            .index
            .index(&self.name, &document.key, source, condition)
            .await?
        {
            return Err(conflict(&document.key, expected, None));
        }
        Ok(())
    }

    async fn remove(&self, key: &str, expected: u64) -> Result<()> {
        let current = self.hit(key).await?;
        let found = current.as_ref().map(|(_, doc)| doc.version);
        let Some((hit, _)) = current.filter(|_| found == Some(expected)) else {
            return Err(conflict(key, Some(expected), found));
        };
        if !self.index.delete(&self.name, key, hit.seq_no).await? {
            return Err(conflict(key, Some(expected), None));
        }
        Ok(())
    }

    async fn scan(&self, prefix: &str, after: Option<&str>, limit: usize) -> Result<Vec<Document>> {
        let query = SearchQuery {
            id_prefix: Some(prefix.to_owned()),
            search_after: after.map(str::to_owned),
            terms: Vec::new(),
            size: limit,
        };
        self.index
            .search(&self.name, &query)
            .await?
            .into_iter()
            .map(|hit| serde_json::from_value(hit.source).map_err(Into::into))
            .collect()
    }
}
