//! Table storage engine for Delve: schema'd tables with predicate scans,
//! nearest-neighbor search and keyed merge-insert, backed by memory or `SQLite`.

pub mod error;
pub mod in_memory_store;
pub mod sqlite;
pub mod table;

pub use error::TableStoreError;
pub use in_memory_store::InMemoryTableStore;
pub use sqlite::SqliteTableStore;
pub use table::{
    Column, ColumnType, Metric, NearestQuery, Predicate, Row, ScoredRow, TableSchema, TableStore,
    Value, escape_like, like_match,
};
