use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

/// Table store backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

impl StorageBackend {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Memory => "memory",
        }
    }
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_sqlite_path() -> String {
    "./data/delve.db".into()
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:11434".into()
}

fn default_embedding_model() -> String {
    "qwen3-embedding".into()
}

fn default_embed_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_embedding_model(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

fn default_max_lines_per_chunk() -> usize {
    32
}

fn default_max_chunk_chars() -> usize {
    2000
}

fn default_max_chunks_per_file() -> usize {
    50
}

fn default_max_in_flight() -> usize {
    8
}

fn default_ready_ratio() -> f64 {
    0.5
}

fn default_content_batch() -> usize {
    100
}

fn default_file_batch() -> usize {
    10
}

fn default_copy_batch() -> usize {
    100
}

fn default_sweep_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Serialize)]
pub struct IndexConfig {
    #[serde(default = "default_max_lines_per_chunk")]
    pub max_lines_per_chunk: usize,
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_max_chunks_per_file")]
    pub max_chunks_per_file: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_ready_ratio")]
    pub ready_ratio: f64,
    #[serde(default = "default_content_batch")]
    pub content_batch: usize,
    #[serde(default = "default_file_batch")]
    pub file_batch: usize,
    #[serde(default = "default_copy_batch")]
    pub copy_batch: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_lines_per_chunk: default_max_lines_per_chunk(),
            max_chunk_chars: default_max_chunk_chars(),
            max_chunks_per_file: default_max_chunks_per_file(),
            max_in_flight: default_max_in_flight(),
            ready_ratio: default_ready_ratio(),
            content_batch: default_content_batch(),
            file_batch: default_file_batch(),
            copy_batch: default_copy_batch(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_query_limit() -> usize {
    10
}

fn default_max_results() -> usize {
    10
}

fn default_distance_ceiling() -> f32 {
    0.5
}

#[derive(Debug, Deserialize, Serialize)]
pub struct QueryConfig {
    #[serde(default = "default_query_limit")]
    pub limit: usize,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Reported on each match; matches above it are still returned.
    #[serde(default = "default_distance_ceiling")]
    pub distance_ceiling: f32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            limit: default_query_limit(),
            max_results: default_max_results(),
            distance_ceiling: default_distance_ceiling(),
        }
    }
}
