//! Workspace indexing orchestrator: walk → hash → dedupe → embed → store → project.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::chunker::{ChunkerConfig, chunk_text};
use crate::content::ContentRecord;
use crate::error::{IndexError, Result};
use crate::files::FileRecord;
use crate::hash::content_hash;
use crate::progress::FileState;
use crate::session::IndexSession;
use crate::text::{is_text_path, looks_like_text};
use delve_llm::EmbeddingProvider;

/// Indexer configuration.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub chunker: ChunkerConfig,
    /// Embedding requests allowed in flight at once (default: 8).
    pub max_in_flight: usize,
    pub embed_timeout: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            max_in_flight: 8,
            embed_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Empty,
    NotText,
    TooManyChunks,
}

/// What happened to one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// New chunks were embedded.
    Embedded { chunks: usize, embedded: usize },
    /// Whole-file hash unchanged and every chunk present.
    CacheHit,
    /// Content changed but every chunk was already embedded.
    Refreshed { chunks: usize },
    Skipped(SkipReason),
}

/// Summary of an indexing run.
#[derive(Debug, Default, Serialize)]
pub struct IndexReport {
    pub files_total: usize,
    pub files_scanned: usize,
    pub files_embedded: usize,
    pub files_cached: usize,
    pub files_refreshed: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub chunks_embedded: usize,
    pub errors: Vec<String>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl IndexReport {
    fn record(&mut self, file: &str, result: Result<FileOutcome>) {
        self.files_scanned += 1;
        match result {
            Ok(FileOutcome::Embedded { embedded, .. }) => {
                self.files_embedded += 1;
                self.chunks_embedded += embedded;
            }
            Ok(FileOutcome::CacheHit) => self.files_cached += 1,
            Ok(FileOutcome::Refreshed { .. }) => self.files_refreshed += 1,
            Ok(FileOutcome::Skipped(_)) => self.files_skipped += 1,
            Err(e) => {
                self.files_failed += 1;
                self.errors.push(format!("{file}: {e:#}"));
            }
        }
    }
}

/// Chunks of one file still waiting for vectors.
struct EmbedJob {
    record: FileRecord,
    chunk_count: usize,
    missing: Vec<(String, String)>,
}

enum Prepared {
    Done(FileOutcome),
    Embed(EmbedJob),
}

/// Orchestrates indexing of one workspace session.
pub struct CodeIndexer<P: EmbeddingProvider> {
    session: IndexSession,
    provider: Arc<P>,
    config: IndexerConfig,
    /// Embedding slots shared by full passes and single-file calls.
    permits: Arc<Semaphore>,
}

impl<P: EmbeddingProvider + 'static> CodeIndexer<P> {
    #[must_use]
    pub fn new(session: IndexSession, provider: Arc<P>, config: IndexerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            session,
            provider,
            config,
            permits,
        }
    }

    #[must_use]
    pub fn session(&self) -> &IndexSession {
        &self.session
    }

    /// Full pass over the workspace. Files are prepared one at a time while up
    /// to `max_in_flight` embedding requests run; when the window is full the
    /// oldest request is awaited first. Buffered writes are flushed at the end.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::AlreadyRunning`] if a pass is in progress, or an
    /// error if listing files or the final flush fails. Per-file failures are
    /// reported in [`IndexReport`] instead.
    pub async fn index_workspace(&self) -> Result<IndexReport> {
        let _guard = self.session.begin_pass()?;
        let start = std::time::Instant::now();
        let mut report = IndexReport::default();

        let files = self.session.fs().list_files(self.session.root()).await?;
        let total = files.len();
        report.files_total = total;
        self.session.progress().begin(total);
        tracing::info!(total, "indexing started");

        let max_in_flight = self.config.max_in_flight.max(1);
        let mut window: VecDeque<(String, JoinHandle<Result<FileOutcome>>)> = VecDeque::new();

        for path in files {
            if !self.session.is_enabled() {
                report.cancelled = true;
                tracing::info!("indexing disabled, stopping pass");
                break;
            }
            let file = path.to_string_lossy().into_owned();
            self.session.progress().set_state(&file, FileState::Indexing);

            match self.prepare(&path).await {
                Ok(Prepared::Done(outcome)) => self.settle(&mut report, &file, Ok(outcome)),
                Ok(Prepared::Embed(job)) => {
                    if window.len() >= max_in_flight
                        && let Some((oldest, handle)) = window.pop_front()
                    {
                        let result = join(handle).await;
                        self.settle(&mut report, &oldest, result);
                    }
                    let permit = match self.acquire().await {
                        Ok(permit) => permit,
                        Err(e) => {
                            self.settle(&mut report, &file, Err(e));
                            continue;
                        }
                    };
                    let session = self.session.clone();
                    let provider = Arc::clone(&self.provider);
                    let timeout = self.config.embed_timeout;
                    let handle = tokio::spawn(async move {
                        let _permit = permit;
                        persist(session, provider, timeout, job).await
                    });
                    window.push_back((file, handle));
                }
                Err(e) => self.settle(&mut report, &file, Err(e)),
            }
        }

        while let Some((file, handle)) = window.pop_front() {
            let result = join(handle).await;
            self.settle(&mut report, &file, result);
        }

        self.session.flush().await?;
        if !report.cancelled {
            self.session.progress().finish();
        }

        report.duration_ms = start.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
        tracing::info!(
            scanned = report.files_scanned,
            embedded = report.files_embedded,
            cached = report.files_cached,
            skipped = report.files_skipped,
            failed = report.files_failed,
            duration_ms = report.duration_ms,
            "indexing finished"
        );
        Ok(report)
    }

    /// Re-index a single file now and flush, for callers reacting to file changes.
    ///
    /// Runs alongside a full pass rather than waiting for it, but takes an
    /// embedding slot from the same pool so `max_in_flight` holds overall.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, embedded or stored.
    pub async fn index_file(&self, path: &Path) -> Result<FileOutcome> {
        let file = path.to_string_lossy().into_owned();
        self.session.progress().set_state(&file, FileState::Indexing);
        let result = match self.prepare(path).await {
            Ok(Prepared::Done(outcome)) => Ok(outcome),
            Ok(Prepared::Embed(job)) => match self.acquire().await {
                Ok(_permit) => {
                    persist(
                        self.session.clone(),
                        Arc::clone(&self.provider),
                        self.config.embed_timeout,
                        job,
                    )
                    .await
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        self.session
            .progress()
            .set_state(&file, state_of(result.as_ref()));
        let outcome = result?;
        self.session.flush().await?;
        Ok(outcome)
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| IndexError::Other(format!("embedding slots unavailable: {e}")))
    }

    fn settle(&self, report: &mut IndexReport, file: &str, result: Result<FileOutcome>) {
        let progress = self.session.progress();
        progress.set_state(file, state_of(result.as_ref()));
        progress.file_done();
        match &result {
            Ok(outcome) => tracing::debug!(
                file,
                ?outcome,
                progress = format_args!("{}/{}", progress.scanned(), progress.total()),
            ),
            Err(e) => tracing::warn!(file, "indexing failed: {e:#}"),
        }
        report.record(file, result);
    }

    async fn prepare(&self, path: &Path) -> Result<Prepared> {
        if !is_text_path(path) {
            return Ok(Prepared::Done(FileOutcome::Skipped(SkipReason::NotText)));
        }
        let bytes = self.session.fs().read(path).await?;
        if bytes.is_empty() {
            return Ok(Prepared::Done(FileOutcome::Skipped(SkipReason::Empty)));
        }
        if !looks_like_text(&bytes) {
            return Ok(Prepared::Done(FileOutcome::Skipped(SkipReason::NotText)));
        }

        let model = self.session.model();
        let file_hash = content_hash(&bytes);
        let filepath = path.to_string_lossy();

        if let Some(existing) = self.session.files().find(&filepath).await?
            && existing.file_hash == file_hash
        {
            let wanted: HashSet<&String> = existing.chunk_hashes.iter().collect();
            let present = self
                .session
                .content()
                .exists_batch(model, &existing.chunk_hashes)
                .await?;
            if present.len() == wanted.len() {
                self.session
                    .projector()
                    .copy_chunks(model, &existing.chunk_hashes)
                    .await?;
                return Ok(Prepared::Done(FileOutcome::CacheHit));
            }
        }

        let text = String::from_utf8_lossy(&bytes);
        let chunks = chunk_text(&text, &self.config.chunker);
        if chunks.len() > self.config.chunker.max_chunks {
            tracing::debug!(file = %filepath, chunks = chunks.len(), "too many chunks, skipping");
            return Ok(Prepared::Done(FileOutcome::Skipped(SkipReason::TooManyChunks)));
        }

        let hashes: Vec<String> = chunks.iter().map(|c| c.hash.clone()).collect();
        let present = self.session.content().exists_batch(model, &hashes).await?;
        let mut seen = HashSet::new();
        let missing: Vec<(String, String)> = chunks
            .into_iter()
            .filter(|c| !present.contains(&c.hash) && seen.insert(c.hash.clone()))
            .map(|c| (c.hash, c.text))
            .collect();

        let chunk_count = hashes.len();
        let record = FileRecord::new(path, file_hash, hashes);
        if missing.is_empty() {
            self.session
                .projector()
                .copy_chunks(model, &record.chunk_hashes)
                .await?;
            self.session.files().upsert_batch(vec![record]).await?;
            return Ok(Prepared::Done(FileOutcome::Refreshed {
                chunks: chunk_count,
            }));
        }

        Ok(Prepared::Embed(EmbedJob {
            record,
            chunk_count,
            missing,
        }))
    }
}

fn state_of(result: std::result::Result<&FileOutcome, &IndexError>) -> FileState {
    match result {
        Ok(FileOutcome::Skipped(_)) => FileState::Skipped,
        Ok(_) => FileState::Indexed,
        Err(_) => FileState::Failed,
    }
}

async fn join(handle: JoinHandle<Result<FileOutcome>>) -> Result<FileOutcome> {
    handle.await?
}

/// Embed the missing chunks of one file, then write content, file record and
/// projection. Nothing is written unless every vector arrived.
async fn persist<P: EmbeddingProvider>(
    session: IndexSession,
    provider: Arc<P>,
    timeout: Duration,
    job: EmbedJob,
) -> Result<FileOutcome> {
    let EmbedJob {
        record,
        chunk_count,
        missing,
    } = job;
    let (hashes, texts): (Vec<String>, Vec<String>) = missing.into_iter().unzip();

    let vectors = tokio::time::timeout(timeout, provider.embed(&texts))
        .await
        .map_err(|_| IndexError::Timeout(timeout.as_millis().try_into().unwrap_or(u64::MAX)))??;
    if vectors.len() != texts.len() {
        return Err(IndexError::Provider {
            expected: texts.len(),
            actual: vectors.len(),
        });
    }

    let model = session.model().clone();
    let embedded = hashes.len();
    let records: Vec<ContentRecord> = hashes
        .into_iter()
        .zip(vectors)
        .map(|(hash, vector)| ContentRecord::new(hash, model.clone(), vector))
        .collect();
    session.content().upsert_batch(records).await?;
    let chunk_hashes = record.chunk_hashes.clone();
    session.files().upsert_batch(vec![record]).await?;
    session.projector().copy_chunks(&model, &chunk_hashes).await?;

    Ok(FileOutcome::Embedded {
        chunks: chunk_count,
        embedded,
    })
}
