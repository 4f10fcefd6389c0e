use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use crate::error::TableStoreError;
use crate::table::{
    BoxFuture, NearestQuery, Predicate, Row, ScoredRow, TableSchema, TableStore, Value,
    check_columns, check_indexable, check_update, rank,
};

type KeySet = BTreeSet<String>;

struct MemTable {
    schema: TableSchema,
    rows: BTreeMap<String, Row>,
    /// column -> indexed value -> keys
    indexes: HashMap<String, HashMap<String, KeySet>>,
}

impl MemTable {
    fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: BTreeMap::new(),
            indexes: HashMap::new(),
        }
    }

    fn index_row(&mut self, key: &str, row: &Row) {
        for (column, index) in &mut self.indexes {
            for value in indexed_values(row.get(column)) {
                index.entry(value).or_default().insert(key.to_owned());
            }
        }
    }

    fn unindex_row(&mut self, key: &str, row: &Row) {
        for (column, index) in &mut self.indexes {
            for value in indexed_values(row.get(column)) {
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }

    fn upsert(&mut self, key: String, row: Row) {
        if let Some(old) = self.rows.remove(&key) {
            self.unindex_row(&key, &old);
        }
        self.index_row(&key, &row);
        self.rows.insert(key, row);
    }

    /// Keys narrowed by secondary indexes, or `None` if no index applies.
    fn candidates(&self, filter: &Predicate) -> Option<KeySet> {
        match filter {
            Predicate::Eq(col, value) => {
                let index = self.indexes.get(col)?;
                let needle = value.as_str()?;
                Some(index.get(needle).cloned().unwrap_or_default())
            }
            Predicate::In(col, values) => {
                let index = self.indexes.get(col)?;
                let mut keys = KeySet::new();
                for v in values {
                    if let Some(found) = v.as_str().and_then(|s| index.get(s)) {
                        keys.extend(found.iter().cloned());
                    }
                }
                Some(keys)
            }
            Predicate::And(parts) => parts
                .iter()
                .filter_map(|p| self.candidates(p))
                .reduce(|a, b| a.intersection(&b).cloned().collect()),
            Predicate::All | Predicate::Like(..) => None,
        }
    }

    fn matching_keys(&self, filter: &Predicate) -> Vec<String> {
        match self.candidates(filter) {
            Some(keys) => keys
                .into_iter()
                .filter(|k| self.rows.get(k).is_some_and(|r| filter.matches(r)))
                .collect(),
            None => self
                .rows
                .iter()
                .filter(|(_, r)| filter.matches(r))
                .map(|(k, _)| k.clone())
                .collect(),
        }
    }
}

fn indexed_values(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Text(s)) => vec![s.clone()],
        Some(Value::TextList(items)) => items.clone(),
        _ => Vec::new(),
    }
}

/// Process-local [`TableStore`] used in tests and for ephemeral sessions.
pub struct InMemoryTableStore {
    tables: RwLock<HashMap<String, MemTable>>,
}

impl InMemoryTableStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryTableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryTableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTableStore").finish_non_exhaustive()
    }
}

fn lock_err(e: impl std::fmt::Display) -> TableStoreError {
    TableStoreError::Lock(e.to_string())
}

fn not_found(table: &str) -> TableStoreError {
    TableStoreError::TableNotFound(table.to_owned())
}

impl TableStore for InMemoryTableStore {
    fn list_tables(&self) -> BoxFuture<'_, Result<Vec<String>, TableStoreError>> {
        Box::pin(async move {
            let tables = self.tables.read().map_err(lock_err)?;
            let mut names: Vec<String> = tables.keys().cloned().collect();
            names.sort();
            Ok(names)
        })
    }

    fn table_exists(&self, table: &str) -> BoxFuture<'_, Result<bool, TableStoreError>> {
        let table = table.to_owned();
        Box::pin(async move {
            let tables = self.tables.read().map_err(lock_err)?;
            Ok(tables.contains_key(&table))
        })
    }

    fn ensure_table(
        &self,
        table: &str,
        schema: TableSchema,
    ) -> BoxFuture<'_, Result<(), TableStoreError>> {
        let table = table.to_owned();
        Box::pin(async move {
            schema.validate()?;
            let mut tables = self.tables.write().map_err(lock_err)?;
            if let Some(existing) = tables.get(&table) {
                if existing.schema != schema {
                    return Err(TableStoreError::Schema(format!(
                        "table {table} exists with a different schema"
                    )));
                }
                return Ok(());
            }
            tables.insert(table, MemTable::new(schema));
            Ok(())
        })
    }

    fn drop_table(&self, table: &str) -> BoxFuture<'_, Result<(), TableStoreError>> {
        let table = table.to_owned();
        Box::pin(async move {
            let mut tables = self.tables.write().map_err(lock_err)?;
            tables.remove(&table);
            Ok(())
        })
    }

    fn scan(
        &self,
        table: &str,
        filter: Predicate,
        limit: Option<usize>,
    ) -> BoxFuture<'_, Result<Vec<Row>, TableStoreError>> {
        let table = table.to_owned();
        Box::pin(async move {
            let tables = self.tables.read().map_err(lock_err)?;
            let t = tables.get(&table).ok_or_else(|| not_found(&table))?;
            check_columns(&t.schema, &filter)?;
            let rows = t
                .matching_keys(&filter)
                .into_iter()
                .filter_map(|k| t.rows.get(&k).cloned())
                .take(limit.unwrap_or(usize::MAX))
                .collect();
            Ok(rows)
        })
    }

    fn nearest(
        &self,
        table: &str,
        query: NearestQuery,
    ) -> BoxFuture<'_, Result<Vec<ScoredRow>, TableStoreError>> {
        let table = table.to_owned();
        Box::pin(async move {
            let tables = self.tables.read().map_err(lock_err)?;
            let t = tables.get(&table).ok_or_else(|| not_found(&table))?;
            check_columns(&t.schema, &query.filter)?;
            let Some(vector_column) = t.schema.vector_column() else {
                return Err(TableStoreError::Schema(format!(
                    "table {table} has no vector column"
                )));
            };
            let keys = t.matching_keys(&query.filter);
            Ok(rank(
                keys.iter().filter_map(|k| t.rows.get(k)),
                vector_column,
                &query,
            ))
        })
    }

    fn merge_insert(
        &self,
        table: &str,
        rows: Vec<Row>,
    ) -> BoxFuture<'_, Result<usize, TableStoreError>> {
        let table = table.to_owned();
        Box::pin(async move {
            let mut tables = self.tables.write().map_err(lock_err)?;
            let t = tables.get_mut(&table).ok_or_else(|| not_found(&table))?;
            let keyed = rows
                .into_iter()
                .map(|row| t.schema.check_row(&row).map(|key| (key, row)))
                .collect::<Result<Vec<_>, _>>()?;
            let written = keyed.len();
            for (key, row) in keyed {
                t.upsert(key, row);
            }
            Ok(written)
        })
    }

    fn update(
        &self,
        table: &str,
        filter: Predicate,
        column: &str,
        value: Value,
    ) -> BoxFuture<'_, Result<usize, TableStoreError>> {
        let table = table.to_owned();
        let column = column.to_owned();
        Box::pin(async move {
            let mut tables = self.tables.write().map_err(lock_err)?;
            let t = tables.get_mut(&table).ok_or_else(|| not_found(&table))?;
            check_columns(&t.schema, &filter)?;
            check_update(&t.schema, &column, &value)?;
            let keys = t.matching_keys(&filter);
            for key in &keys {
                if let Some(mut row) = t.rows.get(key).cloned() {
                    row.insert(column.clone(), value.clone());
                    t.upsert(key.clone(), row);
                }
            }
            Ok(keys.len())
        })
    }

    fn delete(
        &self,
        table: &str,
        filter: Predicate,
    ) -> BoxFuture<'_, Result<usize, TableStoreError>> {
        let table = table.to_owned();
        Box::pin(async move {
            let mut tables = self.tables.write().map_err(lock_err)?;
            let t = tables.get_mut(&table).ok_or_else(|| not_found(&table))?;
            check_columns(&t.schema, &filter)?;
            let keys = t.matching_keys(&filter);
            for key in &keys {
                if let Some(row) = t.rows.remove(key) {
                    t.unindex_row(key, &row);
                }
            }
            Ok(keys.len())
        })
    }

    fn count_rows(&self, table: &str) -> BoxFuture<'_, Result<usize, TableStoreError>> {
        let table = table.to_owned();
        Box::pin(async move {
            let tables = self.tables.read().map_err(lock_err)?;
            let t = tables.get(&table).ok_or_else(|| not_found(&table))?;
            Ok(t.rows.len())
        })
    }

    fn create_index(
        &self,
        table: &str,
        column: &str,
    ) -> BoxFuture<'_, Result<(), TableStoreError>> {
        let table = table.to_owned();
        let column = column.to_owned();
        Box::pin(async move {
            let mut tables = self.tables.write().map_err(lock_err)?;
            let t = tables.get_mut(&table).ok_or_else(|| not_found(&table))?;
            check_indexable(&t.schema, &column)?;
            if t.indexes.contains_key(&column) {
                return Ok(());
            }
            let mut index: HashMap<String, KeySet> = HashMap::new();
            for (key, row) in &t.rows {
                for value in indexed_values(row.get(&column)) {
                    index.entry(value).or_default().insert(key.clone());
                }
            }
            t.indexes.insert(column, index);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{ColumnType, Metric};

    fn schema() -> TableSchema {
        TableSchema::new("id")
            .column("id", ColumnType::Text)
            .column("hash", ColumnType::Text)
            .column("tags", ColumnType::TextList)
            .column("status", ColumnType::Integer)
            .column("vector", ColumnType::Vector)
    }

    fn row(id: &str, hash: &str, tags: &[&str], vector: Vec<f32>) -> Row {
        Row::from([
            ("id".into(), Value::from(id)),
            ("hash".into(), Value::from(hash)),
            (
                "tags".into(),
                Value::from(tags.iter().map(|t| (*t).to_string()).collect::<Vec<_>>()),
            ),
            ("status".into(), Value::from(1)),
            ("vector".into(), Value::from(vector)),
        ])
    }

    async fn seeded() -> InMemoryTableStore {
        let store = InMemoryTableStore::new();
        store.ensure_table("t", schema()).await.unwrap();
        store
            .merge_insert(
                "t",
                vec![
                    row("a", "h1", &["x"], vec![1.0, 0.0]),
                    row("b", "h2", &["x", "y"], vec![0.0, 1.0]),
                    row("c", "h1", &[], vec![0.7, 0.7]),
                ],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn ensure_table_is_idempotent_but_rejects_new_schema() {
        let store = InMemoryTableStore::new();
        store.ensure_table("t", schema()).await.unwrap();
        store.ensure_table("t", schema()).await.unwrap();
        let other = TableSchema::new("id").column("id", ColumnType::Text);
        assert!(matches!(
            store.ensure_table("t", other).await,
            Err(TableStoreError::Schema(_))
        ));
    }

    #[tokio::test]
    async fn missing_table_is_reported() {
        let store = InMemoryTableStore::new();
        assert!(matches!(
            store.count_rows("nope").await,
            Err(TableStoreError::TableNotFound(_))
        ));
        store.drop_table("nope").await.unwrap();
    }

    #[tokio::test]
    async fn merge_insert_overwrites_by_key() {
        let store = seeded().await;
        store
            .merge_insert("t", vec![row("a", "h9", &[], vec![1.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(store.count_rows("t").await.unwrap(), 3);
        let rows = store
            .scan("t", Predicate::eq("id", "a"), None)
            .await
            .unwrap();
        assert_eq!(rows[0]["hash"], Value::from("h9"));
    }

    #[tokio::test]
    async fn merge_insert_rejects_invalid_batch_atomically() {
        let store = seeded().await;
        let mut bad = row("z", "h", &[], vec![1.0]);
        bad.remove("status");
        let res = store
            .merge_insert("t", vec![row("d", "h", &[], vec![1.0, 0.0]), bad])
            .await;
        assert!(res.is_err());
        assert_eq!(store.count_rows("t").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn indexed_and_unindexed_scans_agree() {
        let store = seeded().await;
        let filter = Predicate::any_of("tags", ["y"]).and(Predicate::eq("hash", "h2"));
        let before = store.scan("t", filter.clone(), None).await.unwrap();
        store.create_index("t", "tags").await.unwrap();
        store.create_index("t", "hash").await.unwrap();
        store.create_index("t", "hash").await.unwrap();
        let after = store.scan("t", filter, None).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(after.len(), 1);
    }

    #[tokio::test]
    async fn index_tracks_updates_and_deletes() {
        let store = seeded().await;
        store.create_index("t", "hash").await.unwrap();
        let n = store
            .update("t", Predicate::eq("id", "a"), "hash", Value::from("h2"))
            .await
            .unwrap();
        assert_eq!(n, 1);
        let rows = store
            .scan("t", Predicate::eq("hash", "h2"), None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        let deleted = store.delete("t", Predicate::eq("hash", "h2")).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(
            store
                .scan("t", Predicate::eq("hash", "h2"), None)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn create_index_rejects_vector_column() {
        let store = seeded().await;
        assert!(store.create_index("t", "vector").await.is_err());
    }

    #[tokio::test]
    async fn nearest_ranks_by_cosine_distance() {
        let store = seeded().await;
        let hits = store
            .nearest(
                "t",
                NearestQuery {
                    vector: vec![1.0, 0.1],
                    metric: Metric::Cosine,
                    limit: 2,
                    filter: Predicate::All,
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].row["id"], Value::from("a"));
        assert_eq!(hits[1].row["id"], Value::from("c"));
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[tokio::test]
    async fn scan_with_unknown_column_fails() {
        let store = seeded().await;
        assert!(
            store
                .scan("t", Predicate::eq("missing", "x"), None)
                .await
                .is_err()
        );
    }
}
