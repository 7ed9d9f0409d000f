use std::sync::Arc;

use async_trait::async_trait;

use super::{conflict, Backend};
use crate::{
    driver::{LightweightCondition, Row, WideColumnSession},
    Document, Engine, Result, KEY_SEPARATOR,
};

/// Cassandra-like engine, also used for Dynamo-like hash + range tables.
///
/// Documents live in `{namespace}_documents`, partitioned by the first two key segments with the
/// full key as clustering key. Writes are lightweight transactions on the `version` column.
pub struct WideColumnBackend {
    session: Arc<dyn WideColumnSession>,
    table: String,
    engine: Engine,
}

impl WideColumnBackend {
    pub fn new(session: Arc<dyn WideColumnSession>, namespace: &str) -> WideColumnBackend {
        WideColumnBackend {
            session,
            table: format!("{namespace}_documents"),
            engine: Engine::CassandraLike,
        }
    }

    /// Same layout, reported as another engine.
    pub fn with_engine(mut self, engine: Engine) -> WideColumnBackend {
        self.engine = engine;
        self
    }
}

/// `flags/team/beta` and `flags/team` both live in partition `flags/team`.
fn partition_of(key: &str) -> &str {
    match key.match_indices(KEY_SEPARATOR).nth(1) {
        Some((index, _)) => &key[..index],
        None => key,
    }
}

fn to_row(document: &Document) -> Result<Row> {
    Ok(Row {
        partition: partition_of(&document.key).to_owned(),
        clustering: document.key.clone(),
        value: serde_json::to_string(&document.value)?,
        version: document.version,
    })
}

fn from_row(row: Row) -> Result<Document> {
    Ok(Document::new(
        row.clustering,
        serde_json::from_str(&row.value)?,
        row.version,
    ))
}

#[async_trait]
impl Backend for WideColumnBackend {
    fn engine(&self) -> Engine {
        self.engine
    }

    async fn fetch(&self, key: &str) -> Result<Option<Document>> {
        self.session
            .select(&self.table, partition_of(key), key)
            .await?
            .map(from_row)
            .transpose()
    }

    async fn store(&self, document: &Document, expected: Option<u64>) -> Result<()> {
        let condition = match expected {
            Some(version) => LightweightCondition::VersionEquals(version),
            None => LightweightCondition::NotExists,
        };
        if !self
            .session
            .insert_if(&self.table, to_row(document)?, condition)
            .await?
        {
            return Err(conflict(&document.key, expected, None));
        }
        Ok(())
    }

    async fn remove(&self, key: &str, expected: u64) -> Result<()> {
        if !self
            .session
            .delete_if(&self.table, partition_of(key), key, expected)
            .await?
        {
            return Err(conflict(key, Some(expected), None));
        }
        Ok(())
    }

    /// Partitions do not follow key order, so each candidate partition contributes up to `limit`
    /// rows and the union is sorted.
    async fn scan(&self, prefix: &str, after: Option<&str>, limit: usize) -> Result<Vec<Document>> {
        let partitions = self.session.partitions(&self.table).await?;
        let mut rows = Vec::new();
        for partition in partitions
            .iter()
            .filter(|partition| {
                partition.starts_with(prefix) || prefix.starts_with(partition.as_str())
            })
        {
            rows.extend(
                self.session
                    .select_range(&self.table, partition, prefix, after, limit)
                    .await?,
            );
        }
        rows.sort_unstable_by(|a, b| a.clustering.cmp(&b.clustering));
        rows.truncate(limit);
        rows.into_iter().map(from_row).collect()
    }
}
