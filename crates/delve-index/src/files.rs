//! Per-file index metadata: whole-file hash and ordered chunk hashes.

use std::collections::{HashMap, HashSet};
use std::path::{MAIN_SEPARATOR, Path};
use std::sync::{Arc, Mutex};

use delve_memory::{ColumnType, Predicate, Row, TableSchema, TableStore, Value, escape_like};

use crate::batch::WriteQueue;
use crate::error::{IndexError, Result};
use crate::hash::is_valid_hash;
use crate::walk::FileSystem;

pub const FILE_TABLE: &str = "indexed_files";
pub const SCHEMA_VERSION: i64 = 1;
pub const DEFAULT_FILE_BATCH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub filepath: String,
    pub name: String,
    pub file_hash: String,
    pub chunk_hashes: Vec<String>,
    pub schema_version: i64,
    /// Unix milliseconds of the last (re)index.
    pub updated_at: i64,
}

impl FileRecord {
    #[must_use]
    pub fn new(path: &Path, file_hash: String, chunk_hashes: Vec<String>) -> Self {
        Self {
            filepath: path.to_string_lossy().into_owned(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            file_hash,
            chunk_hashes,
            schema_version: SCHEMA_VERSION,
            updated_at: crate::now_millis(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.filepath.is_empty() {
            return Err(IndexError::Validation("empty filepath".into()));
        }
        if !is_valid_hash(&self.file_hash) {
            return Err(IndexError::Validation(format!(
                "{}: malformed file hash",
                self.filepath
            )));
        }
        if let Some(bad) = self.chunk_hashes.iter().find(|h| !is_valid_hash(h)) {
            return Err(IndexError::Validation(format!(
                "{}: malformed chunk hash {bad:?}",
                self.filepath
            )));
        }
        Ok(())
    }

    fn to_row(&self) -> Row {
        Row::from([
            ("filepath".into(), Value::from(self.filepath.clone())),
            ("name".into(), Value::from(self.name.clone())),
            ("file_hash".into(), Value::from(self.file_hash.clone())),
            ("chunk_hashes".into(), Value::from(self.chunk_hashes.clone())),
            ("schema_version".into(), Value::from(self.schema_version)),
            ("updated_at".into(), Value::from(self.updated_at)),
        ])
    }

    fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            filepath: row.get("filepath")?.as_str()?.to_owned(),
            name: row.get("name")?.as_str()?.to_owned(),
            file_hash: row.get("file_hash")?.as_str()?.to_owned(),
            chunk_hashes: row.get("chunk_hashes")?.as_list()?.to_vec(),
            schema_version: row.get("schema_version")?.as_i64()?,
            updated_at: row.get("updated_at")?.as_i64()?,
        })
    }
}

fn file_schema() -> TableSchema {
    TableSchema::new("filepath")
        .column("filepath", ColumnType::Text)
        .column("name", ColumnType::Text)
        .column("file_hash", ColumnType::Text)
        .column("chunk_hashes", ColumnType::TextList)
        .column("schema_version", ColumnType::Integer)
        .column("updated_at", ColumnType::Integer)
}

/// Predicate matching paths under `prefix`, treated as a directory.
fn under_prefix(prefix: &str) -> Predicate {
    if prefix.is_empty() {
        return Predicate::All;
    }
    let mut dir = prefix.to_owned();
    if !dir.ends_with('/') && !dir.ends_with(MAIN_SEPARATOR) {
        dir.push(MAIN_SEPARATOR);
    }
    Predicate::like("filepath", format!("{}%", escape_like(&dir)))
}

pub struct FileStore {
    store: Arc<dyn TableStore>,
    pending: Mutex<WriteQueue<FileRecord>>,
}

impl FileStore {
    /// Open the file table, creating it and its indexes if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be created.
    pub async fn open(store: Arc<dyn TableStore>, batch_size: usize) -> Result<Self> {
        store.ensure_table(FILE_TABLE, file_schema()).await?;
        store.create_index(FILE_TABLE, "file_hash").await?;
        store.create_index(FILE_TABLE, "chunk_hashes").await?;
        Ok(Self {
            store,
            pending: Mutex::new(WriteQueue::new(batch_size)),
        })
    }

    /// Record for `filepath`; a buffered record wins over the stored one.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub async fn find(&self, filepath: &str) -> Result<Option<FileRecord>> {
        let buffered = self
            .lock_pending()?
            .iter()
            .filter(|r| r.filepath == filepath)
            .last()
            .cloned();
        if buffered.is_some() {
            return Ok(buffered);
        }
        let rows = self
            .store
            .scan(FILE_TABLE, Predicate::eq("filepath", filepath), Some(1))
            .await?;
        Ok(rows.first().and_then(FileRecord::from_row))
    }

    /// Validate then buffer; full batches are written immediately.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Validation`] without buffering anything if any
    /// record is malformed, or a storage error if a batch write fails.
    pub async fn upsert_batch(&self, records: Vec<FileRecord>) -> Result<usize> {
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
        self.write_all(batches).await
    }

    /// Write batches in order; on failure the rest goes back to the queue.
    async fn write_all(&self, batches: Vec<Vec<FileRecord>>) -> Result<usize> {
        let mut written = 0;
        let mut batches = batches.into_iter();
        while let Some(batch) = batches.next() {
            match self.write(&batch).await {
                Ok(n) => written += n,
                Err(e) => {
                    self.lock_pending()?
                        .restore(std::iter::once(batch).chain(batches));
                    tracing::warn!(requeued = self.pending(), "file record write failed: {e:#}");
                    return Err(e);
                }
            }
        }
        Ok(written)
    }

    async fn write(&self, batch: &[FileRecord]) -> Result<usize> {
        let rows: Vec<Row> = batch.iter().map(FileRecord::to_row).collect();
        Ok(self.store.merge_insert(FILE_TABLE, rows).await?)
    }

    /// Files whose chunk list shares a hash with `hashes` and whose path lies
    /// under `path_prefix`, one record per path.
    ///
    /// Ordered by the position of the best matching hash in `hashes`, then
    /// most recently updated, then path.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub async fn query_by_chunk_hashes(
        &self,
        hashes: &[String],
        path_prefix: &str,
    ) -> Result<Vec<FileRecord>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let filter = Predicate::any_of("chunk_hashes", hashes.iter().map(String::as_str))
            .and(under_prefix(path_prefix));

        let mut by_path: HashMap<String, FileRecord> = HashMap::new();
        let rows = self.store.scan(FILE_TABLE, filter.clone(), None).await?;
        for r in rows.iter().filter_map(FileRecord::from_row) {
            by_path.insert(r.filepath.clone(), r);
        }
        for r in self.lock_pending()?.iter() {
            if filter.matches(&r.to_row()) {
                by_path.insert(r.filepath.clone(), r.clone());
            } else {
                // a newer buffered version no longer matches
                by_path.remove(&r.filepath);
            }
        }

        let rank: HashMap<&str, usize> = hashes
            .iter()
            .enumerate()
            .rev()
            .map(|(i, h)| (h.as_str(), i))
            .collect();
        let best = |r: &FileRecord| {
            r.chunk_hashes
                .iter()
                .filter_map(|h| rank.get(h.as_str()).copied())
                .min()
                .unwrap_or(usize::MAX)
        };
        let mut records: Vec<FileRecord> = by_path.into_values().collect();
        records.sort_by(|a, b| {
            best(a)
                .cmp(&best(b))
                .then(b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.filepath.cmp(&b.filepath))
        });
        Ok(records)
    }

    /// Delete the record for `filepath`, buffered or stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete(&self, filepath: &str) -> Result<usize> {
        let dropped = {
            let mut pending = self.lock_pending()?;
            let before = pending.len();
            let kept: Vec<FileRecord> = pending
                .drain()
                .into_iter()
                .flatten()
                .filter(|r| r.filepath != filepath)
                .collect();
            let dropped = before - kept.len();
            pending.extend(kept);
            dropped
        };
        let deleted = self
            .store
            .delete(FILE_TABLE, Predicate::eq("filepath", filepath))
            .await?;
        Ok(deleted.max(usize::from(dropped > 0)))
    }

    /// Remove records whose path no longer exists. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing, scanning or deleting fails.
    pub async fn sweep(&self, fs: &dyn FileSystem) -> Result<usize> {
        self.flush().await?;
        let rows = self.store.scan(FILE_TABLE, Predicate::All, None).await?;
        let mut missing = Vec::new();
        for r in rows.iter().filter_map(FileRecord::from_row) {
            match fs.exists(Path::new(&r.filepath)).await {
                Ok(true) => {}
                Ok(false) => missing.push(r.filepath),
                Err(e) => tracing::warn!(file = %r.filepath, "sweep stat failed: {e:#}"),
            }
        }
        if missing.is_empty() {
            return Ok(0);
        }
        let removed = self
            .store
            .delete(FILE_TABLE, Predicate::any_of("filepath", missing))
            .await?;
        tracing::info!(removed, "stale file records swept");
        Ok(removed)
    }

    /// Number of distinct files, buffered ones included.
    ///
    /// # Errors
    ///
    /// Returns an error if counting fails.
    pub async fn count(&self) -> Result<usize> {
        let buffered: HashSet<String> = self
            .lock_pending()?
            .iter()
            .map(|r| r.filepath.clone())
            .collect();
        let stored = self.store.count_rows(FILE_TABLE).await?;
        if buffered.is_empty() {
            return Ok(stored);
        }
        let already = self
            .store
            .scan(FILE_TABLE, Predicate::any_of("filepath", buffered.iter().map(String::as_str)), None)
            .await?
            .len();
        Ok(stored + buffered.len() - already)
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

    fn lock_pending(&self) -> Result<std::sync::MutexGuard<'_, WriteQueue<FileRecord>>> {
        self.pending
            .lock()
            .map_err(|e| IndexError::Other(format!("file queue lock poisoned: {e}")))
    }
}
