//! Content-addressed codebase embedding index.
//!
//! Workspace files are chunked, chunks are hashed and embedded once per model,
//! and each session projects the chunks of its workspace into a private table
//! that queries search. File records map chunk hashes back to paths.

pub(crate) mod batch;
pub mod chunker;
pub mod content;
pub mod error;
pub mod files;
pub mod hash;
pub mod indexer;
pub mod progress;
pub mod projection;
pub mod retriever;
pub mod session;
pub mod sweeper;
pub mod text;
#[cfg(test)]
mod testing;
pub mod walk;

pub use error::{IndexError, Result};

/// Current time as unix milliseconds.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
