//! Error types for delve-index.

/// Errors that can occur during indexing and retrieval.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// IO error reading workspace files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Table storage error.
    #[error("storage error: {0}")]
    Storage(#[from] delve_memory::TableStoreError),

    /// Embedding provider error.
    #[error("LLM error: {0}")]
    Llm(#[from] delve_llm::LlmError),

    /// A record failed validation before being buffered.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The embedding call exceeded its deadline.
    #[error("embedding timed out after {0} ms")]
    Timeout(u64),

    /// The provider returned no usable vectors.
    #[error("provider returned {actual} vectors for {expected} inputs")]
    Provider { expected: usize, actual: usize },

    /// A full indexing pass is already in progress for this session.
    #[error("indexing already running")]
    AlreadyRunning,

    /// Background task failed to join.
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Generic catch-all error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;
