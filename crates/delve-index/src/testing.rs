//! Table store that rejects a set number of writes, for failure-path tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use delve_memory::{
    InMemoryTableStore, NearestQuery, Predicate, Row, ScoredRow, TableSchema, TableStore,
    TableStoreError, Value,
};

type Fut<'a, T> = Pin<Box<dyn Future<Output = Result<T, TableStoreError>> + Send + 'a>>;

#[derive(Default)]
pub(crate) struct FlakyStore {
    inner: InMemoryTableStore,
    failures: AtomicUsize,
}

impl FlakyStore {
    /// Reject the next `n` merge-inserts.
    pub(crate) fn fail_next_writes(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

impl TableStore for FlakyStore {
    fn list_tables(&self) -> Fut<'_, Vec<String>> {
        self.inner.list_tables()
    }

    fn table_exists(&self, table: &str) -> Fut<'_, bool> {
        self.inner.table_exists(table)
    }

    fn ensure_table(&self, table: &str, schema: TableSchema) -> Fut<'_, ()> {
        self.inner.ensure_table(table, schema)
    }

    fn drop_table(&self, table: &str) -> Fut<'_, ()> {
        self.inner.drop_table(table)
    }

    fn scan(&self, table: &str, filter: Predicate, limit: Option<usize>) -> Fut<'_, Vec<Row>> {
        self.inner.scan(table, filter, limit)
    }

    fn nearest(&self, table: &str, query: NearestQuery) -> Fut<'_, Vec<ScoredRow>> {
        self.inner.nearest(table, query)
    }

    fn merge_insert(&self, table: &str, rows: Vec<Row>) -> Fut<'_, usize> {
        let rejected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            let table = table.to_owned();
            return Box::pin(async move {
                Err(TableStoreError::Schema(format!("write to {table} rejected")))
            });
        }
        self.inner.merge_insert(table, rows)
    }

    fn update(&self, table: &str, filter: Predicate, column: &str, value: Value) -> Fut<'_, usize> {
        self.inner.update(table, filter, column, value)
    }

    fn delete(&self, table: &str, filter: Predicate) -> Fut<'_, usize> {
        self.inner.delete(table, filter)
    }

    fn count_rows(&self, table: &str) -> Fut<'_, usize> {
        self.inner.count_rows(table)
    }

    fn create_index(&self, table: &str, column: &str) -> Fut<'_, ()> {
        self.inner.create_index(table, column)
    }
}
