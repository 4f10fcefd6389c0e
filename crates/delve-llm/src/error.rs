#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("provider unavailable")]
    Unavailable,

    #[error("expected {expected} embeddings from {provider}, got {actual}")]
    CountMismatch {
        provider: String,
        expected: usize,
        actual: usize,
    },

    #[error("bridge channel closed")]
    ChannelClosed,

    #[error("{0}")]
    Other(String),
}
