//! Builds stores, providers and sessions from a loaded [`Config`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;

use delve_index::chunker::ChunkerConfig;
use delve_index::content::{ContentStore, ModelId, TableHandle};
use delve_index::files::FileStore;
use delve_index::indexer::{CodeIndexer, IndexerConfig};
use delve_index::retriever::{CodeRetriever, RetrievalConfig};
use delve_index::session::{IndexSession, SessionConfig};
use delve_index::walk::LocalFileSystem;
use delve_llm::{AnyProvider, EmbeddingProvider, OllamaProvider};
use delve_memory::{InMemoryTableStore, SqliteTableStore, TableStore};

use crate::config::{Config, StorageBackend, StorageConfig};

/// Open the configured table store, creating the database directory if needed.
///
/// # Errors
///
/// Returns an error if the directory or database cannot be created.
pub async fn create_table_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn TableStore>> {
    match config.backend {
        StorageBackend::Memory => {
            tracing::info!("using in-memory table store");
            Ok(Arc::new(InMemoryTableStore::new()))
        }
        StorageBackend::Sqlite => {
            let path = &config.sqlite_path;
            if path != ":memory:"
                && let Some(parent) = Path::new(path).parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
            let store = SqliteTableStore::new(path)
                .await
                .with_context(|| format!("failed to open sqlite store at {path}"))?;
            tracing::info!(path, "sqlite table store ready");
            Ok(Arc::new(store))
        }
    }
}

#[must_use]
pub fn create_provider(config: &Config) -> AnyProvider {
    AnyProvider::Ollama(OllamaProvider::new(
        &config.embedding.base_url,
        config.embedding.model.clone(),
    ))
}

#[must_use]
pub fn session_config(config: &Config) -> SessionConfig {
    SessionConfig {
        content_batch: config.index.content_batch,
        file_batch: config.index.file_batch,
        copy_batch: config.index.copy_batch,
        ready_ratio: config.index.ready_ratio,
    }
}

#[must_use]
pub fn indexer_config(config: &Config) -> IndexerConfig {
    IndexerConfig {
        chunker: ChunkerConfig {
            max_lines: config.index.max_lines_per_chunk,
            max_chars: config.index.max_chunk_chars,
            max_chunks: config.index.max_chunks_per_file,
        },
        max_in_flight: config.index.max_in_flight,
        embed_timeout: Duration::from_secs(config.embedding.timeout_secs),
    }
}

#[must_use]
pub fn retrieval_config(config: &Config) -> RetrievalConfig {
    RetrievalConfig {
        limit: config.query.limit,
        max_results: config.query.max_results,
        distance_ceiling: config.query.distance_ceiling,
        embed_timeout: Duration::from_secs(config.embedding.timeout_secs),
    }
}

/// A session with its indexer and retriever, sharing one provider.
pub struct Workspace<P: EmbeddingProvider> {
    pub session: IndexSession,
    pub indexer: CodeIndexer<P>,
    pub retriever: CodeRetriever<P>,
}

/// Open an index session rooted at `root`.
///
/// The root is canonicalized so file records and workspace tables stay stable
/// across invocations from different working directories.
///
/// # Errors
///
/// Returns an error if the root does not exist or the session cannot be opened.
pub async fn open_workspace<P: EmbeddingProvider + 'static>(
    config: &Config,
    store: Arc<dyn TableStore>,
    provider: Arc<P>,
    root: &Path,
) -> anyhow::Result<Workspace<P>> {
    let root = std::fs::canonicalize(root)
        .with_context(|| format!("workspace {} not found", root.display()))?;
    let session = IndexSession::open(
        store,
        Arc::new(LocalFileSystem),
        ModelId::from(provider.model_id()),
        &root,
        &session_config(config),
    )
    .await
    .context("failed to open index session")?;

    let indexer = CodeIndexer::new(
        session.clone(),
        Arc::clone(&provider),
        indexer_config(config),
    );
    let retriever = CodeRetriever::new(session.clone(), provider, retrieval_config(config));
    Ok(Workspace {
        session,
        indexer,
        retriever,
    })
}

/// What the index holds for one workspace.
#[derive(Debug, Serialize)]
pub struct WorkspaceStatus {
    pub workspace: String,
    pub backend: String,
    pub provider: String,
    pub model: String,
    pub content_table: String,
    pub workspace_table: String,
    pub content_records: usize,
    pub file_records: usize,
    pub projected_records: usize,
}

/// Inspect the stores for `root` without opening a session, so the projection
/// left by a running or earlier session stays in place.
///
/// # Errors
///
/// Returns an error if the root does not exist or a store cannot be read.
pub async fn workspace_status<P: EmbeddingProvider>(
    config: &Config,
    store: Arc<dyn TableStore>,
    provider: &P,
    root: &Path,
) -> anyhow::Result<WorkspaceStatus> {
    let root = std::fs::canonicalize(root)
        .with_context(|| format!("workspace {} not found", root.display()))?;
    let root = root.to_string_lossy().into_owned();
    let model = ModelId::from(provider.model_id());

    let content = ContentStore::new(Arc::clone(&store), config.index.content_batch);
    let content_table = content.table_for(&model).await?;
    let files = FileStore::open(Arc::clone(&store), config.index.file_batch).await?;
    let workspace_table = TableHandle::for_workspace(&root);
    let projected_records = if store.table_exists(workspace_table.name()).await? {
        store.count_rows(workspace_table.name()).await?
    } else {
        0
    };

    Ok(WorkspaceStatus {
        workspace: root,
        backend: config.storage.backend.to_string(),
        provider: provider.name().to_owned(),
        model: model.to_string(),
        content_table: content_table.name().to_owned(),
        workspace_table: workspace_table.name().to_owned(),
        content_records: content.count(&model).await?,
        file_records: files.count().await?,
        projected_records,
    })
}
