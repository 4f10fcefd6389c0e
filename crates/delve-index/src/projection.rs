//! Session-scoped copy of the content rows that belong to the open workspace.
//!
//! Searching only this table keeps results inside the workspace even though
//! the content tables are shared by every workspace ever indexed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use delve_memory::{Metric, Predicate, Row, Value};

use crate::batch::WriteQueue;
use crate::content::{ContentHit, ContentStore, ModelId, TableHandle, ensure_content_table};
use crate::error::{IndexError, Result};

pub const DEFAULT_COPY_BATCH: usize = 100;

pub struct WorkspaceProjector {
    content: Arc<ContentStore>,
    table: TableHandle,
    queue: Mutex<WriteQueue<(ModelId, String)>>,
    created: AtomicBool,
}

impl WorkspaceProjector {
    /// Begin a session for `root`, discarding any projection left by an earlier one.
    ///
    /// # Errors
    ///
    /// Returns an error if the old table cannot be dropped.
    pub async fn start(content: Arc<ContentStore>, root: &str, batch_size: usize) -> Result<Self> {
        let table = TableHandle::for_workspace(root);
        content.table_store().drop_table(table.name()).await?;
        tracing::debug!(%table, root, "workspace projection reset");
        Ok(Self {
            content,
            table,
            queue: Mutex::new(WriteQueue::new(batch_size)),
            created: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn table(&self) -> &TableHandle {
        &self.table
    }

    /// Queue `hashes` for projection; every full batch is copied right away.
    ///
    /// # Errors
    ///
    /// Returns an error if copying a batch fails.
    pub async fn copy_chunks(&self, model: &ModelId, hashes: &[String]) -> Result<usize> {
        let batches = {
            let mut queue = self.lock_queue()?;
            queue.extend(hashes.iter().map(|h| (model.clone(), h.clone())));
            queue.take_full()
        };
        self.copy_all(batches).await
    }

    /// Copy the partial tail of the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if copying fails.
    pub async fn flush(&self) -> Result<usize> {
        let batches = self.lock_queue()?.drain();
        self.copy_all(batches).await
    }

    async fn copy_all(&self, batches: Vec<Vec<(ModelId, String)>>) -> Result<usize> {
        let mut copied = 0;
        let mut batches = batches.into_iter();
        while let Some(batch) = batches.next() {
            match self.copy(&batch).await {
                Ok(n) => copied += n,
                Err(e) => {
                    self.lock_queue()?
                        .restore(std::iter::once(batch).chain(batches));
                    tracing::warn!(requeued = self.pending(), "projection copy failed: {e:#}");
                    return Err(e);
                }
            }
        }
        Ok(copied)
    }

    async fn copy(&self, batch: &[(ModelId, String)]) -> Result<usize> {
        let mut by_model: BTreeMap<ModelId, BTreeSet<String>> = BTreeMap::new();
        for (model, hash) in batch {
            by_model
                .entry(model.clone())
                .or_default()
                .insert(hash.clone());
        }

        let store = self.content.table_store();
        let mut copied = 0;
        for (model, hashes) in by_model {
            let hashes: Vec<String> = hashes.into_iter().collect();
            let present: BTreeSet<String> = if self.created.load(Ordering::Acquire) {
                let filter = Predicate::any_of("chunk_hash", hashes.iter().map(String::as_str))
                    .and(Predicate::eq("model_id", model.as_str()));
                store
                    .scan(self.table.name(), filter, None)
                    .await?
                    .iter()
                    .filter_map(|r| r.get("chunk_hash").and_then(Value::as_str))
                    .map(str::to_owned)
                    .collect()
            } else {
                BTreeSet::new()
            };
            let missing: Vec<String> = hashes
                .into_iter()
                .filter(|h| !present.contains(h))
                .collect();
            if missing.is_empty() {
                continue;
            }
            let rows: Vec<Row> = self
                .content
                .fetch(&model, &missing)
                .await?
                .iter()
                .map(crate::content::ContentRecord::to_row)
                .collect();
            if rows.len() < missing.len() {
                tracing::debug!(
                    %model,
                    missing = missing.len() - rows.len(),
                    "projection skipped hashes without content"
                );
            }
            if rows.is_empty() {
                continue;
            }
            if !self.created.load(Ordering::Acquire) {
                ensure_content_table(store.as_ref(), &self.table).await?;
                self.created.store(true, Ordering::Release);
            }
            copied += store.merge_insert(self.table.name(), rows).await?;
        }
        Ok(copied)
    }

    /// Nearest visible projected chunks by cosine distance.
    ///
    /// # Errors
    ///
    /// Returns an error if the search fails.
    pub async fn query(&self, vector: Vec<f32>, limit: usize) -> Result<Vec<ContentHit>> {
        self.content
            .query(&self.table, vector, limit, Metric::Cosine)
            .await
    }

    /// Rows currently projected.
    ///
    /// # Errors
    ///
    /// Returns an error if counting fails.
    pub async fn count(&self) -> Result<usize> {
        let store = self.content.table_store();
        if !store.table_exists(self.table.name()).await? {
            return Ok(0);
        }
        Ok(store.count_rows(self.table.name()).await?)
    }

    /// Change the copy threshold.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue lock is poisoned.
    pub fn set_batch_size(&self, batch_size: usize) -> Result<()> {
        self.lock_queue()?.set_batch_size(batch_size);
        Ok(())
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().map_or(0, |q| q.len())
    }

    fn lock_queue(&self) -> Result<std::sync::MutexGuard<'_, WriteQueue<(ModelId, String)>>> {
        self.queue
            .lock()
            .map_err(|e| IndexError::Other(format!("projection queue lock poisoned: {e}")))
    }
}
