//! Embedding over a message channel to a host process.
//!
//! Each request carries a fresh correlation ID; the host answers by calling
//! [`BridgeProvider::handle_response`] with the same ID. Unanswered requests
//! resolve to an empty result after the timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::LlmError;
use crate::provider::EmbeddingProvider;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound message. Inputs are base64 so arbitrary source text survives the host channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedRequest {
    pub request_id: String,
    pub model: String,
    pub input: Vec<String>,
}

impl EmbedRequest {
    #[must_use]
    pub fn new(request_id: String, model: &str, texts: &[String]) -> Self {
        Self {
            request_id,
            model: model.to_owned(),
            input: texts.iter().map(|t| STANDARD.encode(t)).collect(),
        }
    }

    /// Decode the base64 inputs back to text.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Other`] if an input is not valid base64 or UTF-8.
    pub fn decode_input(&self) -> Result<Vec<String>, LlmError> {
        self.input
            .iter()
            .map(|encoded| {
                let bytes = STANDARD
                    .decode(encoded)
                    .map_err(|e| LlmError::Other(format!("invalid base64 input: {e}")))?;
                String::from_utf8(bytes)
                    .map_err(|e| LlmError::Other(format!("invalid utf-8 input: {e}")))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedResponse {
    pub request_id: String,
    pub embeddings: Vec<Vec<f32>>,
}

/// Correlation table: ID to a single-resolution reply slot.
#[derive(Debug)]
pub struct PendingRequests<T> {
    slots: Mutex<HashMap<String, oneshot::Sender<T>>>,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Default> PendingRequests<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(id.to_owned(), tx);
        }
        rx
    }

    /// Deliver `value` to the waiter. Returns `false` if the ID is unknown or already resolved.
    pub fn resolve(&self, id: &str, value: T) -> bool {
        let sender = self.slots.lock().ok().and_then(|mut s| s.remove(id));
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Resolve the waiter with `T::default()`.
    pub fn cancel(&self, id: &str) -> bool {
        self.resolve(id, T::default())
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.slots.lock().is_ok_and(|s| s.contains_key(id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().map_or(0, |s| s.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a slot when its waiter goes away, including when the caller drops
/// the future mid-send or mid-wait. A no-op once the slot was resolved.
struct SlotGuard<'a, T> {
    pending: &'a PendingRequests<T>,
    id: &'a str,
}

impl<T> Drop for SlotGuard<'_, T> {
    fn drop(&mut self) {
        if let Ok(mut slots) = self.pending.slots.lock() {
            slots.remove(self.id);
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeProvider {
    model: String,
    outbound: mpsc::Sender<EmbedRequest>,
    pending: Arc<PendingRequests<Vec<Vec<f32>>>>,
    timeout: Duration,
}

impl BridgeProvider {
    /// Create a provider and the receiving end the host reads requests from.
    #[must_use]
    pub fn new(model: &str, capacity: usize) -> (Self, mpsc::Receiver<EmbedRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let provider = Self {
            model: model.to_owned(),
            outbound: tx,
            pending: Arc::new(PendingRequests::new()),
            timeout: DEFAULT_TIMEOUT,
        };
        (provider, rx)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Route a host reply to the waiting request.
    pub fn handle_response(&self, response: EmbedResponse) -> bool {
        let delivered = self
            .pending
            .resolve(&response.request_id, response.embeddings);
        if !delivered {
            tracing::debug!(request_id = %response.request_id, "late or unknown embedding response");
        }
        delivered
    }

    /// Abandon a request; its caller receives an empty result.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.pending.cancel(request_id)
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl EmbeddingProvider for BridgeProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request_id = uuid::Uuid::new_v4().to_string();
        let rx = self.pending.register(&request_id);
        let _slot = SlotGuard {
            pending: &*self.pending,
            id: &request_id,
        };
        let request = EmbedRequest::new(request_id.clone(), &self.model, texts);

        if self.outbound.send(request).await.is_err() {
            return Err(LlmError::ChannelClosed);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(vectors)) => Ok(vectors),
            Ok(Err(_)) => Ok(Vec::new()),
            Err(_) => {
                tracing::warn!(%request_id, timeout_ms = self.timeout.as_millis(), "embedding request timed out");
                Ok(Vec::new())
            }
        }
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "bridge"
    }
}
