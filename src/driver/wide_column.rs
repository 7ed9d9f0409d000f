//! Wide-column store interface (Cassandra-like, also covering Dynamo-like hash + range tables).
use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::Result;

/// A row of a document table: partition key, clustering key and the serialized document.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub partition: String,
    pub clustering: String,
    pub value: String,
    pub version: u64,
}

/// Condition of a lightweight transaction (`IF NOT EXISTS` / `IF version = ?`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightweightCondition {
    NotExists,
    VersionEquals(u64),
}

#[async_trait]
pub trait WideColumnSession: Send + Sync {
    async fn select(&self, table: &str, partition: &str, clustering: &str) -> Result<Option<Row>>;

    /// Conditional insert. Returns `false` when the condition did not hold.
    async fn insert_if(&self, table: &str, row: Row, condition: LightweightCondition)
        -> Result<bool>;

    /// Conditional delete. Returns `false` when the row is absent or has another version.
    async fn delete_if(
        &self,
        table: &str,
        partition: &str,
        clustering: &str,
        version: u64,
    ) -> Result<bool>;

    /// Rows of one partition whose clustering key starts with `prefix` and sorts after `after`,
    /// in clustering order.
    async fn select_range(
        &self,
        table: &str,
        partition: &str,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Row>>;

    /// Distinct partition keys of `table`.
    async fn partitions(&self, table: &str) -> Result<Vec<String>>;

    /// Counter column update (`UPDATE ... SET c = c + ?`).
    async fn add_counter(&self, table: &str, partition: &str, column: &str, delta: i64)
        -> Result<()>;

    async fn counters(&self, table: &str, partition: &str) -> Result<BTreeMap<String, i64>>;
}

type Partitions = HashMap<String, BTreeMap<String, Row>>;

/// Embedded wide-column store.
#[derive(Default)]
pub struct MemoryWideColumn {
    tables: RwLock<HashMap<String, Partitions>>,
    counters: RwLock<HashMap<(String, String), BTreeMap<String, i64>>>,
}

impl MemoryWideColumn {
    pub fn new() -> MemoryWideColumn {
        MemoryWideColumn::default()
    }
}

#[async_trait]
impl WideColumnSession for MemoryWideColumn {
    async fn select(&self, table: &str, partition: &str, clustering: &str) -> Result<Option<Row>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|partitions| partitions.get(partition))
            .and_then(|rows| rows.get(clustering))
            .cloned())
    }

    async fn insert_if(
        &self,
        table: &str,
        row: Row,
        condition: LightweightCondition,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        let rows = tables
            .entry(table.to_owned())
            .or_default()
            .entry(row.partition.clone())
            .or_default();
        let holds = match (condition, rows.get(&row.clustering)) {
            (LightweightCondition::NotExists, None) => true,
            (LightweightCondition::VersionEquals(version), Some(current)) => {
                current.version == version
            }
            _ => false,
        };
        if holds {
            rows.insert(row.clustering.clone(), row);
        }
        Ok(holds)
    }

    async fn delete_if(
        &self,
        table: &str,
        partition: &str,
        clustering: &str,
        version: u64,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        let Some(rows) = tables
            .get_mut(table)
            .and_then(|partitions| partitions.get_mut(partition))
        else {
            return Ok(false);
        };
        if rows.get(clustering).map(|row| row.version) != Some(version) {
            return Ok(false);
        }
        rows.remove(clustering);
        if rows.is_empty() {
            if let Some(partitions) = tables.get_mut(table) {
                partitions.remove(partition);
            }
        }
        Ok(true)
    }

    async fn select_range(
        &self,
        table: &str,
        partition: &str,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let tables = self.tables.read();
        let Some(rows) = tables
            .get(table)
            .and_then(|partitions| partitions.get(partition))
        else {
            return Ok(Vec::new());
        };
        let start = match after {
            Some(after) if after >= prefix => Bound::Excluded(after),
            _ => Bound::Included(prefix),
        };
        Ok(rows
            .range::<str, _>((start, Bound::Unbounded))
            .take_while(|(clustering, _)| clustering.starts_with(prefix))
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn partitions(&self, table: &str) -> Result<Vec<String>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|partitions| partitions.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_counter(
        &self,
        table: &str,
        partition: &str,
        column: &str,
        delta: i64,
    ) -> Result<()> {
        *self
            .counters
            .write()
            .entry((table.to_owned(), partition.to_owned()))
            .or_default()
            .entry(column.to_owned())
            .or_default() += delta;
        Ok(())
    }

    async fn counters(&self, table: &str, partition: &str) -> Result<BTreeMap<String, i64>> {
        Ok(self
            .counters
            .read()
            .get(&(table.to_owned(), partition.to_owned()))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(clustering: &str, version: u64) -> Row {
        Row {
            partition: "p".into(),
            clustering: clustering.into(),
            value: "{}".into(),
            version,
        }
    }

    #[tokio::test]
    async fn lightweight_transactions() {
        let session = MemoryWideColumn::new();
        assert!(session
            .insert_if("t", row("a", 1), LightweightCondition::NotExists)
            .await
            .unwrap());
        assert!(!session
            .insert_if("t", row("a", 2), LightweightCondition::NotExists)
            .await
            .unwrap());
        assert!(!session
            .insert_if("t", row("a", 3), LightweightCondition::VersionEquals(2))
            .await
            .unwrap());
        assert!(session
            .insert_if("t", row("a", 3), LightweightCondition::VersionEquals(1))
            .await
            .unwrap());
        assert!(!session.delete_if("t", "p", "a", 1).await.unwrap());
        assert!(session.delete_if("t", "p", "a", 3).await.unwrap());
        assert!(session.partitions("t").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn range_selects_in_clustering_order() {
        let session = MemoryWideColumn::new();
        for clustering in ["p/c", "p/a", "q/a", "p/b"] {
            session
                .insert_if("t", row(clustering, 1), LightweightCondition::NotExists)
                .await
                .unwrap();
        }
        let rows = session
            .select_range("t", "p", "p/", Some("p/a"), 10)
            .await
            .unwrap();
        let keys: Vec<_> = rows.iter().map(|row| row.clustering.as_str()).collect();
        assert_eq!(keys, vec!["p/b", "p/c"]);
    }
}
