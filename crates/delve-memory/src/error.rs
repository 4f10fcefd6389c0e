/// Errors raised by a [`crate::TableStore`] backend.
#[derive(Debug, thiserror::Error)]
pub enum TableStoreError {
    #[error("table {0} not found")]
    TableNotFound(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("database error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("lock poisoned: {0}")]
    Lock(String),
}
