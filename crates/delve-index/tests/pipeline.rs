use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use delve_index::IndexError;
use delve_index::chunker::{ChunkerConfig, chunk_text};
use delve_index::content::ModelId;
use delve_index::hash::content_hash;
use delve_index::indexer::{CodeIndexer, FileOutcome, IndexerConfig, SkipReason};
use delve_index::progress::FileState;
use delve_index::retriever::{CodeRetriever, RetrievalConfig};
use delve_index::session::{IndexSession, SessionConfig};
use delve_index::walk::LocalFileSystem;
use delve_llm::mock::MockProvider;
use delve_llm::{EmbeddingProvider, LlmError};
use delve_memory::{InMemoryTableStore, SqliteTableStore, TableStore};

async fn open(store: Arc<dyn TableStore>, root: &Path, provider: &MockProvider) -> IndexSession {
    IndexSession::open(
        store,
        Arc::new(LocalFileSystem),
        ModelId::from(provider.model_id()),
        root,
        &SessionConfig::default(),
    )
    .await
    .unwrap()
}

fn indexer(session: &IndexSession, provider: &MockProvider) -> CodeIndexer<MockProvider> {
    CodeIndexer::new(
        session.clone(),
        Arc::new(provider.clone()),
        IndexerConfig::default(),
    )
}

fn retriever(session: &IndexSession, provider: &MockProvider) -> CodeRetriever<MockProvider> {
    CodeRetriever::new(
        session.clone(),
        Arc::new(provider.clone()),
        RetrievalConfig::default(),
    )
}

fn ten_lines() -> String {
    (0..10).map(|i| format!("unique line number {i}\n")).collect()
}

/// 64 lines of 70 characters: two chunks that never merge.
fn two_chunk_file(second_half: &str) -> String {
    let mut text = String::new();
    for i in 0..32 {
        text.push_str(&format!("{:<69}\n", format!("first half line {i}")));
    }
    for i in 0..32 {
        text.push_str(&format!("{:<69}\n", format!("{second_half} line {i}")));
    }
    text
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[tokio::test]
async fn new_file_is_embedded_once_and_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.txt");
    std::fs::write(&file, ten_lines()).unwrap();

    let provider = MockProvider::default();
    let session = open(Arc::new(InMemoryTableStore::new()), dir.path(), &provider).await;
    let report = indexer(&session, &provider).index_workspace().await.unwrap();

    assert_eq!(report.files_embedded, 1);
    assert_eq!(report.chunks_embedded, 1);
    assert_eq!(provider.calls(), 1);
    assert_eq!(provider.seen_texts(), vec![ten_lines()]);

    let h1 = content_hash(ten_lines().as_bytes());
    let record = session.files().find(&key(&file)).await.unwrap().unwrap();
    assert_eq!(record.chunk_hashes, vec![h1.clone()]);
    assert_eq!(record.file_hash, h1);
    assert_eq!(record.name, "a.txt");
    let present = session
        .content()
        .exists_batch(session.model(), &[h1.clone()])
        .await
        .unwrap();
    assert!(present.contains(&h1));
    assert_eq!(session.file_state(&file), FileState::Indexed);
}

#[tokio::test]
async fn unchanged_file_is_a_cache_hit() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), ten_lines()).unwrap();

    let provider = MockProvider::default();
    let session = open(Arc::new(InMemoryTableStore::new()), dir.path(), &provider).await;
    let idx = indexer(&session, &provider);
    idx.index_workspace().await.unwrap();
    let second = idx.index_workspace().await.unwrap();

    assert_eq!(second.files_cached, 1);
    assert_eq!(second.files_embedded, 0);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn modified_file_embeds_only_new_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.txt");
    let first = two_chunk_file("second half");
    assert_eq!(chunk_text(&first, &ChunkerConfig::default()).len(), 2);
    std::fs::write(&file, &first).unwrap();

    let provider = MockProvider::default();
    let session = open(Arc::new(InMemoryTableStore::new()), dir.path(), &provider).await;
    let idx = indexer(&session, &provider);
    idx.index_workspace().await.unwrap();
    assert_eq!(provider.seen_texts().len(), 2);

    let modified = two_chunk_file("rewritten");
    std::fs::write(&file, &modified).unwrap();
    let report = idx.index_workspace().await.unwrap();

    assert_eq!(report.files_embedded, 1);
    assert_eq!(report.chunks_embedded, 1);
    assert_eq!(provider.calls(), 2);
    let new_chunks = chunk_text(&modified, &ChunkerConfig::default());
    let seen = provider.seen_texts();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[2], new_chunks[1].text);

    let record = session.files().find(&key(&file)).await.unwrap().unwrap();
    let expected: Vec<String> = new_chunks.iter().map(|c| c.hash.clone()).collect();
    assert_eq!(record.chunk_hashes, expected);
}

#[tokio::test]
async fn identical_vector_query_resolves_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.txt");
    std::fs::write(&file, ten_lines()).unwrap();
    std::fs::write(dir.path().join("b.txt"), "something else entirely\n").unwrap();

    let provider = MockProvider::default();
    let session = open(Arc::new(InMemoryTableStore::new()), dir.path(), &provider).await;
    indexer(&session, &provider).index_workspace().await.unwrap();

    let vector = provider.vector_for(&ten_lines());
    let hits = session.projector().query(vector.clone(), 10).await.unwrap();
    assert_eq!(hits[0].chunk_hash, content_hash(ten_lines().as_bytes()));
    assert!(hits[0].distance.abs() < 1e-5);

    let matches = retriever(&session, &provider)
        .search_vector(vector)
        .await
        .unwrap();
    assert_eq!(matches[0].filepath, key(&file));
    assert!(matches[0].within_ceiling);
    assert_eq!(matches.len(), 2);

    let by_text = retriever(&session, &provider).retrieve(&ten_lines()).await;
    assert_eq!(by_text[0].filepath, key(&file));
}

#[tokio::test]
async fn sweep_forgets_deleted_files() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.txt");
    std::fs::write(&file, ten_lines()).unwrap();

    let provider = MockProvider::default();
    let session = open(Arc::new(InMemoryTableStore::new()), dir.path(), &provider).await;
    indexer(&session, &provider).index_workspace().await.unwrap();
    assert!(session.files().find(&key(&file)).await.unwrap().is_some());

    std::fs::remove_file(&file).unwrap();
    assert_eq!(session.sweep().await.unwrap(), 1);
    assert!(session.files().find(&key(&file)).await.unwrap().is_none());
}

#[tokio::test]
async fn queries_stay_inside_the_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let ws1 = dir.path().join("ws1");
    let ws2 = dir.path().join("ws2");
    std::fs::create_dir_all(&ws1).unwrap();
    std::fs::create_dir_all(&ws2).unwrap();
    std::fs::write(ws1.join("x.txt"), ten_lines()).unwrap();
    std::fs::write(ws2.join("y.txt"), ten_lines()).unwrap();

    let store: Arc<dyn TableStore> = Arc::new(InMemoryTableStore::new());
    let provider = MockProvider::default();

    let first = open(Arc::clone(&store), &ws1, &provider).await;
    indexer(&first, &provider).index_workspace().await.unwrap();
    let second = open(Arc::clone(&store), &ws2, &provider).await;
    let report = indexer(&second, &provider).index_workspace().await.unwrap();

    // shared content: the second workspace reuses the first one's vector
    assert_eq!(report.files_refreshed, 1);
    assert_eq!(provider.calls(), 1);
    assert_eq!(second.content().count(second.model()).await.unwrap(), 1);

    let matches = retriever(&second, &provider)
        .search_vector(provider.vector_for(&ten_lines()))
        .await
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].filepath, key(&ws2.join("y.txt")));
}

#[tokio::test]
async fn identical_files_share_one_content_record() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), ten_lines()).unwrap();
    std::fs::write(dir.path().join("b.txt"), ten_lines()).unwrap();

    let provider = MockProvider::default();
    let session = open(Arc::new(InMemoryTableStore::new()), dir.path(), &provider).await;
    indexer(&session, &provider).index_workspace().await.unwrap();

    assert_eq!(session.content().count(session.model()).await.unwrap(), 1);
    assert_eq!(session.files().count().await.unwrap(), 2);
    assert_eq!(session.projector().count().await.unwrap(), 1);
}

#[tokio::test]
async fn provider_failures_write_nothing() {
    for provider in [
        MockProvider::failing(),
        MockProvider::returning_empty(),
        MockProvider::default().with_short_responses(),
    ] {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, two_chunk_file("tail")).unwrap();

        let session = open(Arc::new(InMemoryTableStore::new()), dir.path(), &provider).await;
        let report = indexer(&session, &provider).index_workspace().await.unwrap();

        assert_eq!(report.files_failed, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(session.files().find(&key(&file)).await.unwrap().is_none());
        assert_eq!(session.content().count(session.model()).await.unwrap(), 0);
        assert_eq!(session.file_state(&file), FileState::Failed);
    }
}

#[tokio::test(start_paused = true)]
async fn slow_provider_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.txt");
    std::fs::write(&file, ten_lines()).unwrap();

    let provider = MockProvider::default().with_delay(60_000);
    let session = open(Arc::new(InMemoryTableStore::new()), dir.path(), &provider).await;
    let err = indexer(&session, &provider)
        .index_file(&file)
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::Timeout(10_000)));
    assert!(session.files().find(&key(&file)).await.unwrap().is_none());
}

#[tokio::test]
async fn unsuitable_files_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("logo.png"), ten_lines()).unwrap();
    std::fs::write(dir.path().join("empty.txt"), "").unwrap();
    std::fs::write(dir.path().join("blob.dat"), vec![0u8; 512]).unwrap();
    let huge: String = (0..2000).map(|i| format!("{i:<90}\n")).collect();
    std::fs::write(dir.path().join("huge.txt"), huge).unwrap();

    let provider = MockProvider::default();
    let session = open(Arc::new(InMemoryTableStore::new()), dir.path(), &provider).await;
    let report = indexer(&session, &provider).index_workspace().await.unwrap();

    assert_eq!(report.files_skipped, 4);
    assert_eq!(provider.calls(), 0);
    assert_eq!(session.file_state(&dir.path().join("huge.txt")), FileState::Skipped);
    assert_eq!(session.files().count().await.unwrap(), 0);
}

#[tokio::test]
async fn index_file_reports_skip_reason() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("empty.txt");
    std::fs::write(&file, "").unwrap();

    let provider = MockProvider::default();
    let session = open(Arc::new(InMemoryTableStore::new()), dir.path(), &provider).await;
    let outcome = indexer(&session, &provider).index_file(&file).await.unwrap();
    assert_eq!(outcome, FileOutcome::Skipped(SkipReason::Empty));
}

#[tokio::test]
async fn index_file_makes_new_file_searchable() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::default();
    let session = open(Arc::new(InMemoryTableStore::new()), dir.path(), &provider).await;
    let idx = indexer(&session, &provider);
    idx.index_workspace().await.unwrap();

    let file = dir.path().join("late.txt");
    std::fs::write(&file, ten_lines()).unwrap();
    let outcome = idx.index_file(&file).await.unwrap();
    assert_eq!(
        outcome,
        FileOutcome::Embedded {
            chunks: 1,
            embedded: 1
        }
    );
    let matches = retriever(&session, &provider).retrieve(&ten_lines()).await;
    assert_eq!(matches[0].filepath, key(&file));
}

#[tokio::test]
async fn readiness_gates_queries() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), ten_lines()).unwrap();

    let provider = MockProvider::default();
    let session = open(Arc::new(InMemoryTableStore::new()), dir.path(), &provider).await;
    assert!(!session.is_ready());
    assert!(retriever(&session, &provider).retrieve("anything").await.is_empty());

    indexer(&session, &provider).index_workspace().await.unwrap();
    assert!(session.is_ready());
    assert!((session.progress().display_progress() - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn empty_workspace_becomes_ready() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::default();
    let session = open(Arc::new(InMemoryTableStore::new()), dir.path(), &provider).await;
    let report = indexer(&session, &provider).index_workspace().await.unwrap();
    assert_eq!(report.files_total, 0);
    assert!(session.is_ready());
}

#[tokio::test]
async fn disabled_session_stops_before_first_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), ten_lines()).unwrap();

    let provider = MockProvider::default();
    let session = open(Arc::new(InMemoryTableStore::new()), dir.path(), &provider).await;
    session.set_enabled(false);
    let report = indexer(&session, &provider).index_workspace().await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.files_scanned, 0);
    assert!(!session.is_ready());
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn concurrent_pass_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), ten_lines()).unwrap();

    let provider = MockProvider::default().with_delay(50);
    let session = open(Arc::new(InMemoryTableStore::new()), dir.path(), &provider).await;
    let idx = indexer(&session, &provider);
    let (first, second) = tokio::join!(idx.index_workspace(), idx.index_workspace());

    assert!(first.is_ok());
    assert!(matches!(second, Err(IndexError::AlreadyRunning)));
    assert!(idx.index_workspace().await.is_ok());
}

#[tokio::test]
async fn sqlite_index_survives_new_session() {
    let dir = tempfile::tempdir().unwrap();
    let ws = dir.path().join("ws");
    std::fs::create_dir_all(&ws).unwrap();
    std::fs::write(ws.join("a.txt"), ten_lines()).unwrap();
    let db = dir.path().join("index.db");
    let db = db.to_str().unwrap();

    let provider = MockProvider::default();
    {
        let store: Arc<dyn TableStore> = Arc::new(SqliteTableStore::new(db).await.unwrap());
        let session = open(store, &ws, &provider).await;
        indexer(&session, &provider).index_workspace().await.unwrap();
    }

    let store: Arc<dyn TableStore> = Arc::new(SqliteTableStore::new(db).await.unwrap());
    let session = open(store, &ws, &provider).await;
    assert_eq!(session.projector().count().await.unwrap(), 0);
    let report = indexer(&session, &provider).index_workspace().await.unwrap();

    assert_eq!(report.files_cached, 1);
    assert_eq!(provider.calls(), 1);
    let matches = retriever(&session, &provider).retrieve(&ten_lines()).await;
    assert_eq!(matches.len(), 1);
}

#[tokio::test]
async fn sweeper_runs_until_shutdown() {
    use delve_index::sweeper::spawn_sweeper;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.txt");
    std::fs::write(&file, ten_lines()).unwrap();

    let provider = MockProvider::default();
    let session = open(Arc::new(InMemoryTableStore::new()), dir.path(), &provider).await;
    indexer(&session, &provider).index_workspace().await.unwrap();
    std::fs::remove_file(&file).unwrap();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = spawn_sweeper(session.clone(), std::time::Duration::from_millis(20), rx);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    tx.send(true).unwrap();
    handle.await.unwrap();

    assert!(session.files().find(&key(&file)).await.unwrap().is_none());
}

/// Holds every embed call until the gate opens, recording peak concurrency.
struct GatedProvider {
    active: AtomicUsize,
    peak: AtomicUsize,
    gate: tokio::sync::watch::Sender<bool>,
}

impl GatedProvider {
    fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            gate: tokio::sync::watch::channel(false).0,
        }
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    /// Wait until `n` calls are held, then give stragglers a chance to show up.
    async fn settle_at(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.active() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

impl EmbeddingProvider for GatedProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        #[allow(clippy::cast_precision_loss)]
        let vectors = texts.iter().map(|t| vec![1.0, t.len() as f32]).collect();
        Ok(vectors)
    }

    fn model_id(&self) -> &str {
        "gated"
    }

    fn name(&self) -> &str {
        "gated"
    }
}

async fn gated_indexer(
    root: &Path,
    max_in_flight: usize,
) -> (Arc<GatedProvider>, CodeIndexer<GatedProvider>) {
    let provider = Arc::new(GatedProvider::new());
    let session = IndexSession::open(
        Arc::new(InMemoryTableStore::new()),
        Arc::new(LocalFileSystem),
        ModelId::from(provider.model_id()),
        root,
        &SessionConfig::default(),
    )
    .await
    .unwrap();
    let config = IndexerConfig {
        max_in_flight,
        ..IndexerConfig::default()
    };
    let indexer = CodeIndexer::new(session, Arc::clone(&provider), config);
    (provider, indexer)
}

#[tokio::test]
async fn embedding_requests_stay_within_window() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..12 {
        let body = format!("file {i} body\n");
        std::fs::write(dir.path().join(format!("f{i}.txt")), body).unwrap();
    }
    let (provider, idx) = gated_indexer(dir.path(), 8).await;

    let control = async {
        provider.settle_at(8).await;
        let held = provider.active();
        provider.open_gate();
        held
    };
    let (report, held) = tokio::join!(idx.index_workspace(), control);

    let report = report.unwrap();
    assert_eq!(held, 8);
    assert_eq!(provider.peak(), 8);
    assert_eq!(report.files_embedded, 12);
}

#[tokio::test]
async fn single_file_shares_the_window_with_a_pass() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..4 {
        let body = format!("file {i} body\n");
        std::fs::write(dir.path().join(format!("f{i}.txt")), body).unwrap();
    }
    let other = tempfile::tempdir().unwrap();
    let extra = other.path().join("extra.txt");
    std::fs::write(&extra, "edited elsewhere\n").unwrap();
    let (provider, idx) = gated_indexer(dir.path(), 2).await;

    let control = async {
        provider.settle_at(2).await;
        let held = provider.active();
        provider.open_gate();
        held
    };
    let (report, single, held) =
        tokio::join!(idx.index_workspace(), idx.index_file(&extra), control);

    assert_eq!(held, 2);
    assert_eq!(provider.peak(), 2);
    assert_eq!(report.unwrap().files_embedded, 4);
    assert!(matches!(single.unwrap(), FileOutcome::Embedded { .. }));
}
