mod env;
mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use std::path::Path;

use anyhow::{Context, bail};

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Reject values the index cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.embedding.model.trim().is_empty() {
            bail!("embedding.model must not be empty");
        }
        if self.embedding.timeout_secs == 0 {
            bail!("embedding.timeout_secs must be at least 1");
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.sqlite_path.is_empty() {
            bail!("storage.sqlite_path must be set for the sqlite backend");
        }
        let index = &self.index;
        if index.max_lines_per_chunk == 0 || index.max_chunk_chars == 0 {
            bail!("index chunk limits must be at least 1");
        }
        if index.max_chunks_per_file == 0 {
            bail!("index.max_chunks_per_file must be at least 1");
        }
        if index.max_in_flight == 0 {
            bail!("index.max_in_flight must be at least 1");
        }
        if !(0.0..=1.0).contains(&index.ready_ratio) {
            bail!(
                "index.ready_ratio must be within [0, 1], got {}",
                index.ready_ratio
            );
        }
        if index.content_batch == 0 || index.file_batch == 0 || index.copy_batch == 0 {
            bail!("index batch sizes must be at least 1");
        }
        if index.sweep_interval_secs == 0 {
            bail!("index.sweep_interval_secs must be at least 1");
        }
        if self.query.limit == 0 || self.query.max_results == 0 {
            bail!("query.limit and query.max_results must be at least 1");
        }
        if !self.query.distance_ceiling.is_finite() || self.query.distance_ceiling < 0.0 {
            bail!("query.distance_ceiling must be a non-negative number");
        }
        Ok(())
    }
}
