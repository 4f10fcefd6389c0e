//! Content-addressed store of chunk embeddings, one table per model.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use delve_memory::{
    ColumnType, Metric, NearestQuery, Predicate, Row, TableSchema, TableStore, Value,
};

use crate::batch::WriteQueue;
use crate::error::{IndexError, Result};
use crate::hash::{is_valid_hash, short_hash};

pub const DEFAULT_CONTENT_BATCH: usize = 100;

/// Identifier of an embedding model. Vectors of different models never mix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(String);

impl ModelId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Physical table name derived from a hash, never from the raw string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableHandle(String);

impl TableHandle {
    #[must_use]
    pub fn for_model(model: &ModelId) -> Self {
        Self(format!("content_{}", short_hash(model.as_str().as_bytes())))
    }

    #[must_use]
    pub fn for_workspace(root: &str) -> Self {
        Self(format!("workspace_{}", short_hash(root.as_bytes())))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Hidden,
    Visible,
}

impl Visibility {
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Hidden => 0,
            Self::Visible => 1,
        }
    }

    #[must_use]
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Hidden),
            1 => Some(Self::Visible),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentRecord {
    pub chunk_hash: String,
    pub model_id: ModelId,
    pub vector: Vec<f32>,
    pub status: Visibility,
    /// Unix milliseconds.
    pub created_at: i64,
}

impl ContentRecord {
    #[must_use]
    pub fn new(chunk_hash: String, model_id: ModelId, vector: Vec<f32>) -> Self {
        Self {
            chunk_hash,
            model_id,
            vector,
            status: Visibility::Visible,
            created_at: crate::now_millis(),
        }
    }

    /// Unique key: hash and model together.
    #[must_use]
    pub fn id(&self) -> String {
        record_id(&self.chunk_hash, &self.model_id)
    }

    fn validate(&self) -> Result<()> {
        if !is_valid_hash(&self.chunk_hash) {
            return Err(IndexError::Validation(format!(
                "malformed chunk hash {:?}",
                self.chunk_hash
            )));
        }
        if self.model_id.as_str().is_empty() {
            return Err(IndexError::Validation("empty model id".into()));
        }
        if self.vector.is_empty() {
            return Err(IndexError::Validation(format!(
                "empty vector for {}",
                self.chunk_hash
            )));
        }
        Ok(())
    }

    pub(crate) fn to_row(&self) -> Row {
        Row::from([
            ("id".into(), Value::from(self.id())),
            ("chunk_hash".into(), Value::from(self.chunk_hash.clone())),
            ("model_id".into(), Value::from(self.model_id.as_str())),
            ("vector".into(), Value::from(self.vector.clone())),
            ("status".into(), Value::from(self.status.as_i64())),
            ("created_at".into(), Value::from(self.created_at)),
        ])
    }

    pub(crate) fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            chunk_hash: row.get("chunk_hash")?.as_str()?.to_owned(),
            model_id: ModelId::new(row.get("model_id")?.as_str()?),
            vector: row.get("vector")?.as_vector()?.to_vec(),
            status: Visibility::from_i64(row.get("status")?.as_i64()?)?,
            created_at: row.get("created_at")?.as_i64()?,
        })
    }
}

fn record_id(hash: &str, model: &ModelId) -> String {
    format!("{hash}.{model}")
}

/// Schema shared by content tables and workspace projections.
#[must_use]
pub fn content_schema() -> TableSchema {
    TableSchema::new("id")
        .column("id", ColumnType::Text)
        .column("chunk_hash", ColumnType::Text)
        .column("model_id", ColumnType::Text)
        .column("vector", ColumnType::Vector)
        .column("status", ColumnType::Integer)
        .column("created_at", ColumnType::Integer)
}

/// Create `table` with the content schema and its hash indexes.
pub(crate) async fn ensure_content_table(store: &dyn TableStore, table: &TableHandle) -> Result<()> {
    store.ensure_table(table.name(), content_schema()).await?;
    store.create_index(table.name(), "id").await?;
    store.create_index(table.name(), "chunk_hash").await?;
    Ok(())
}

/// Chunk hash and distance of one search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHit {
    pub chunk_hash: String,
    pub distance: f32,
}

pub struct ContentStore {
    store: Arc<dyn TableStore>,
    tables: Mutex<HashMap<ModelId, TableHandle>>,
    pending: Mutex<WriteQueue<ContentRecord>>,
}

impl ContentStore {
    #[must_use]
    pub fn new(store: Arc<dyn TableStore>, batch_size: usize) -> Self {
        Self {
            store,
            tables: Mutex::new(HashMap::new()),
            pending: Mutex::new(WriteQueue::new(batch_size)),
        }
    }

    #[must_use]
    pub fn table_store(&self) -> &Arc<dyn TableStore> {
        &self.store
    }

    /// Table for `model`, created with its indexes on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be created.
    pub async fn table_for(&self, model: &ModelId) -> Result<TableHandle> {
        if let Some(handle) = self.lock_tables()?.get(model) {
            return Ok(handle.clone());
        }
        let handle = TableHandle::for_model(model);
        ensure_content_table(self.store.as_ref(), &handle).await?;
        self.lock_tables()?.insert(model.clone(), handle.clone());
        tracing::debug!(%model, table = %handle, "content table ready");
        Ok(handle)
    }

    /// Subset of `hashes` present for `model`, buffered records included.
    ///
    /// # Errors
    ///
    /// Returns an error if the table scan fails.
    pub async fn exists_batch(&self, model: &ModelId, hashes: &[String]) -> Result<HashSet<String>> {
        if hashes.is_empty() {
            return Ok(HashSet::new());
        }
        let wanted: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        let mut found: HashSet<String> = self
            .lock_pending()?
            .iter()
            .filter(|r| &r.model_id == model && wanted.contains(r.chunk_hash.as_str()))
            .map(|r| r.chunk_hash.clone())
            .collect();

        let rest: Vec<&str> = wanted
            .iter()
            .copied()
            .filter(|h| !found.contains(*h))
            .collect();
        if rest.is_empty() {
            return Ok(found);
        }
        let table = self.table_for(model).await?;
        let rows = self
            .store
            .scan(table.name(), Predicate::any_of("chunk_hash", rest), None)
            .await?;
        found.extend(
            rows.iter()
                .filter_map(|r| r.get("chunk_hash").and_then(Value::as_str))
                .map(str::to_owned),
        );
        Ok(found)
    }

    /// Validate then buffer `records`; full batches are written immediately.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Validation`] without buffering anything if any
    /// record is malformed, or a storage error if a batch write fails.
    pub async fn upsert_batch(&self, records: Vec<ContentRecord>) -> Result<usize> {
        for r in &records {
            r.validate()?;
        }
        let batches = {
            let mut pending = self.lock_pending()?;
            pending.extend(records);
            pending.take_full()
        };
        self.write_all(batches).await
    }

    /// Write every buffered record.
    ///
    /// # Errors
    ///
    /// Returns an error if a batch write fails.
    pub async fn flush(&self) -> Result<usize> {
        let batches = self.lock_pending()?.drain();
        let written = self.write_all(batches).await?;
        if written > 0 {
            tracing::debug!(written, "content records flushed");
        }
        Ok(written)
    }

    /// Write batches in order. A failed batch and every later one are put back
    /// in the queue so the next flush retries them.
    async fn write_all(&self, batches: Vec<Vec<ContentRecord>>) -> Result<usize> {
        let mut written = 0;
        let mut batches = batches.into_iter();
        while let Some(batch) = batches.next() {
            match self.write(&batch).await {
                Ok(n) => written += n,
                Err(e) => {
                    self.lock_pending()?
                        .restore(std::iter::once(batch).chain(batches));
                    tracing::warn!(requeued = self.pending(), "content write failed: {e:#}");
                    return Err(e);
                }
            }
        }
        Ok(written)
    }

    async fn write(&self, batch: &[ContentRecord]) -> Result<usize> {
        let mut by_model: HashMap<ModelId, Vec<Row>> = HashMap::new();
        for r in batch {
            by_model.entry(r.model_id.clone()).or_default().push(r.to_row());
        }
        let mut written = 0;
        for (model, rows) in by_model {
            let table = self.table_for(&model).await?;
            written += self.store.merge_insert(table.name(), rows).await?;
        }
        Ok(written)
    }

    /// Soft-toggle visibility. Returns the number of records changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the hash is malformed or the update fails.
    pub async fn update_status(
        &self,
        model: &ModelId,
        hash: &str,
        status: Visibility,
    ) -> Result<usize> {
        if !is_valid_hash(hash) {
            return Err(IndexError::Validation(format!("malformed chunk hash {hash:?}")));
        }
        let mut changed = 0;
        {
            let mut pending = self.lock_pending()?;
            for r in pending.iter_mut() {
                if &r.model_id == model && r.chunk_hash == hash {
                    r.status = status;
                    changed += 1;
                }
            }
        }
        let table = self.table_for(model).await?;
        changed += self
            .store
            .update(
                table.name(),
                Predicate::eq("id", record_id(hash, model)),
                "status",
                Value::from(status.as_i64()),
            )
            .await?;
        Ok(changed)
    }

    /// Nearest visible rows of `table` by `metric`, ascending distance.
    /// A table that does not exist yields no hits.
    ///
    /// # Errors
    ///
    /// Returns an error if the search fails.
    pub async fn query(
        &self,
        table: &TableHandle,
        vector: Vec<f32>,
        limit: usize,
        metric: Metric,
    ) -> Result<Vec<ContentHit>> {
        if !self.store.table_exists(table.name()).await? {
            return Ok(Vec::new());
        }
        let hits = self
            .store
            .nearest(
                table.name(),
                NearestQuery {
                    vector,
                    metric,
                    limit,
                    filter: Predicate::eq("status", Visibility::Visible.as_i64()),
                },
            )
            .await?;
        Ok(hits
            .into_iter()
            .filter_map(|h| {
                Some(ContentHit {
                    chunk_hash: h.row.get("chunk_hash")?.as_str()?.to_owned(),
                    distance: h.distance,
                })
            })
            .collect())
    }

    /// Full records for `hashes`, buffered ones included.
    ///
    /// # Errors
    ///
    /// Returns an error if the table scan fails.
    pub async fn fetch(&self, model: &ModelId, hashes: &[String]) -> Result<Vec<ContentRecord>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let wanted: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        let mut records: Vec<ContentRecord> = self
            .lock_pending()?
            .iter()
            .filter(|r| &r.model_id == model && wanted.contains(r.chunk_hash.as_str()))
            .cloned()
            .collect();
        let buffered: HashSet<String> = records.iter().map(|r| r.chunk_hash.clone()).collect();
        let rest: Vec<&str> = wanted
            .iter()
            .copied()
            .filter(|h| !buffered.contains(*h))
            .collect();
        if !rest.is_empty() {
            let table = self.table_for(model).await?;
            let rows = self
                .store
                .scan(table.name(), Predicate::any_of("chunk_hash", rest), None)
                .await?;
            records.extend(rows.iter().filter_map(ContentRecord::from_row));
        }
        Ok(records)
    }

    /// Distinct records for `model`, buffered ones included.
    ///
    /// # Errors
    ///
    /// Returns an error if counting fails.
    pub async fn count(&self, model: &ModelId) -> Result<usize> {
        let buffered: HashSet<String> = self
            .lock_pending()?
            .iter()
            .filter(|r| &r.model_id == model)
            .map(|r| r.chunk_hash.clone())
            .collect();
        let table = self.table_for(model).await?;
        let stored = self.store.count_rows(table.name()).await?;
        if buffered.is_empty() {
            return Ok(stored);
        }
        let already: HashSet<String> = self
            .store
            .scan(
                table.name(),
                Predicate::any_of("chunk_hash", buffered.iter().map(String::as_str)),
                None,
            )
            .await?
            .iter()
            .filter_map(|r| r.get("chunk_hash").and_then(Value::as_str))
            .map(str::to_owned)
            .collect();
        Ok(stored + buffered.difference(&already).count())
    }

    /// Change the flush threshold.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue lock is poisoned.
    pub fn set_batch_size(&self, batch_size: usize) -> Result<()> {
        self.lock_pending()?.set_batch_size(batch_size);
        Ok(())
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.lock().map_or(0, |p| p.len())
    }

    fn lock_pending(&self) -> Result<std::sync::MutexGuard<'_, WriteQueue<ContentRecord>>> {
        self.pending
            .lock()
            .map_err(|e| IndexError::Other(format!("content queue lock poisoned: {e}")))
    }

    fn lock_tables(&self) -> Result<std::sync::MutexGuard<'_, HashMap<ModelId, TableHandle>>> {
        self.tables
            .lock()
            .map_err(|e| IndexError::Other(format!("content table map lock poisoned: {e}")))
    }
}
