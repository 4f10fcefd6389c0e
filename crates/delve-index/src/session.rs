//! Everything one workspace session shares: stores, projection, progress and flags.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use delve_memory::TableStore;

use crate::content::{ContentStore, DEFAULT_CONTENT_BATCH, ModelId};
use crate::error::{IndexError, Result};
use crate::files::{DEFAULT_FILE_BATCH, FileStore};
use crate::progress::{FileState, IndexProgress};
use crate::projection::{DEFAULT_COPY_BATCH, WorkspaceProjector};
use crate::walk::FileSystem;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub content_batch: usize,
    pub file_batch: usize,
    pub copy_batch: usize,
    /// Fraction of scanned files at which queries are served (default: 0.5).
    pub ready_ratio: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            content_batch: DEFAULT_CONTENT_BATCH,
            file_batch: DEFAULT_FILE_BATCH,
            copy_batch: DEFAULT_COPY_BATCH,
            ready_ratio: 0.5,
        }
    }
}

/// Shared session context. Cloning is cheap; clones see the same state.
#[derive(Clone)]
pub struct IndexSession {
    content: Arc<ContentStore>,
    files: Arc<FileStore>,
    projector: Arc<WorkspaceProjector>,
    fs: Arc<dyn FileSystem>,
    model: ModelId,
    root: PathBuf,
    enabled: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    progress: Arc<IndexProgress>,
}

impl std::fmt::Debug for IndexSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSession")
            .field("model", &self.model)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl IndexSession {
    /// Open a session for `root`. The workspace projection of any earlier
    /// session on the same root is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the file table or projection cannot be set up.
    pub async fn open(
        store: Arc<dyn TableStore>,
        fs: Arc<dyn FileSystem>,
        model: ModelId,
        root: &Path,
        config: &SessionConfig,
    ) -> Result<Self> {
        let content = Arc::new(ContentStore::new(Arc::clone(&store), config.content_batch));
        let files = Arc::new(FileStore::open(store, config.file_batch).await?);
        let root_str = root.to_string_lossy();
        let projector =
            Arc::new(WorkspaceProjector::start(Arc::clone(&content), &root_str, config.copy_batch).await?);
        tracing::info!(root = %root.display(), %model, "index session opened");
        Ok(Self {
            content,
            files,
            projector,
            fs,
            model,
            root: root.to_path_buf(),
            enabled: Arc::new(AtomicBool::new(true)),
            running: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(IndexProgress::new(config.ready_ratio)),
        })
    }

    #[must_use]
    pub fn content(&self) -> &Arc<ContentStore> {
        &self.content
    }

    #[must_use]
    pub fn files(&self) -> &Arc<FileStore> {
        &self.files
    }

    #[must_use]
    pub fn projector(&self) -> &Arc<WorkspaceProjector> {
        &self.projector
    }

    #[must_use]
    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    #[must_use]
    pub fn model(&self) -> &ModelId {
        &self.model
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn progress(&self) -> &IndexProgress {
        &self.progress
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.progress.is_ready()
    }

    #[must_use]
    pub fn file_state(&self, path: &Path) -> FileState {
        self.progress.state(&path.to_string_lossy())
    }

    /// Allow or stop indexing. A running pass stops before its next file.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Mark a full pass as running until the guard drops.
    pub(crate) fn begin_pass(&self) -> Result<PassGuard> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(IndexError::AlreadyRunning);
        }
        Ok(PassGuard(Arc::clone(&self.running)))
    }

    /// Write every buffered content record, file record and projection copy.
    ///
    /// # Errors
    ///
    /// Returns an error if any store fails to flush.
    pub async fn flush(&self) -> Result<()> {
        let content = self.content.flush().await?;
        let files = self.files.flush().await?;
        let copied = self.projector.flush().await?;
        tracing::debug!(content, files, copied, "session flushed");
        Ok(())
    }

    /// Drop file records whose paths no longer exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the sweep fails.
    pub async fn sweep(&self) -> Result<usize> {
        self.files.sweep(self.fs.as_ref()).await
    }
}

pub(crate) struct PassGuard(Arc<AtomicBool>);

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
