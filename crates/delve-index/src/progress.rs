//! Indexing progress and per-file state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    NotIndexed,
    Indexing,
    Indexed,
    Skipped,
    Failed,
}

#[derive(Debug)]
pub struct IndexProgress {
    scanned: AtomicUsize,
    total: AtomicUsize,
    completed: AtomicBool,
    ready_ratio: f64,
    states: Mutex<HashMap<String, FileState>>,
}

impl IndexProgress {
    #[must_use]
    pub fn new(ready_ratio: f64) -> Self {
        Self {
            scanned: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            completed: AtomicBool::new(false),
            ready_ratio,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn begin(&self, total: usize) {
        self.scanned.store(0, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
    }

    pub(crate) fn file_done(&self) {
        self.scanned.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn finish(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_state(&self, file: &str, state: FileState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(file.to_owned(), state);
        }
    }

    #[must_use]
    pub fn state(&self, file: &str) -> FileState {
        self.states
            .lock()
            .ok()
            .and_then(|s| s.get(file).copied())
            .unwrap_or(FileState::NotIndexed)
    }

    #[must_use]
    pub fn scanned(&self) -> usize {
        self.scanned.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// `scanned / total`; 0 before anything was counted.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn ratio(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return if self.completed.load(Ordering::SeqCst) {
                1.0
            } else {
                0.0
            };
        }
        self.scanned() as f64 / total as f64
    }

    /// Ready once the ratio reaches the threshold or any full pass has finished.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.completed.load(Ordering::SeqCst) || self.ratio() >= self.ready_ratio
    }

    /// Ratio shown to users: reported as complete as soon as the index is ready.
    #[must_use]
    pub fn display_progress(&self) -> f64 {
        if self.is_ready() { 1.0 } else { self.ratio() }
    }
}
