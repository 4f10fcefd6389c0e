//! Embedding provider abstraction and backend implementations.

pub mod any;
pub mod bridge;
pub mod error;
#[cfg(feature = "mock")]
pub mod mock;
pub mod ollama;
pub mod provider;

pub use any::AnyProvider;
pub use bridge::{BridgeProvider, EmbedRequest, EmbedResponse, PendingRequests};
pub use error::LlmError;
pub use ollama::OllamaProvider;
pub use provider::EmbeddingProvider;
