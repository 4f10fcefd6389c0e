//! Test-only mock embedding provider.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::LlmError;
use crate::provider::EmbeddingProvider;

/// Deterministic embeddings derived from a hash of each input text.
#[derive(Debug, Clone)]
pub struct MockProvider {
    model: String,
    pub dimensions: usize,
    pub fail_embed: bool,
    /// Return no vectors at all, as a timed-out bridge request does.
    pub empty: bool,
    /// Drop the last vector of every response.
    pub short: bool,
    /// Milliseconds to sleep before returning a response.
    pub delay_ms: u64,
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<String>>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new("mock-embed")
    }
}

impl MockProvider {
    #[must_use]
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_owned(),
            dimensions: 8,
            fail_embed: false,
            empty: false,
            short: false,
            delay_ms: 0,
            calls: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_embed: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn returning_empty() -> Self {
        Self {
            empty: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    #[must_use]
    pub fn with_short_responses(mut self) -> Self {
        self.short = true;
        self
    }

    /// Number of `embed` calls made so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every text passed to `embed`, in call order.
    #[must_use]
    pub fn seen_texts(&self) -> Vec<String> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// The vector this provider returns for `text`.
    #[must_use]
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let digest = blake3::hash(text.as_bytes());
        digest
            .as_bytes()
            .iter()
            .cycle()
            .take(self.dimensions)
            .map(|b| f32::from(*b) / 255.0 + 0.01)
            .collect()
    }
}

impl EmbeddingProvider for MockProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.extend(texts.iter().cloned());
        }
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if self.fail_embed {
            return Err(LlmError::Unavailable);
        }
        if self.empty {
            return Ok(Vec::new());
        }
        let mut out: Vec<Vec<f32>> = texts.iter().map(|t| self.vector_for(t)).collect();
        if self.short {
            out.pop();
        }
        Ok(out)
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "mock"
    }
}
