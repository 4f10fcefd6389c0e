//! Query-time retrieval: embed the query, search the workspace projection,
//! resolve chunk hashes back to files.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::{IndexError, Result};
use crate::session::IndexSession;
use delve_llm::EmbeddingProvider;

/// Retrieval configuration.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Nearest chunks fetched from the projection (default: 10).
    pub limit: usize,
    /// Files returned at most (default: 10).
    pub max_results: usize,
    /// Distance at or below which a match counts as relevant. Reported on
    /// each match, not used to filter.
    pub distance_ceiling: f32,
    pub embed_timeout: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            max_results: 10,
            distance_ceiling: 0.5,
            embed_timeout: Duration::from_secs(10),
        }
    }
}

/// A workspace file holding one of the nearest chunks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileMatch {
    pub filepath: String,
    pub name: String,
    /// Distance of the closest chunk of this file.
    pub distance: f32,
    pub within_ceiling: bool,
}

pub struct CodeRetriever<P: EmbeddingProvider> {
    session: IndexSession,
    provider: Arc<P>,
    config: RetrievalConfig,
}

impl<P: EmbeddingProvider> CodeRetriever<P> {
    #[must_use]
    pub fn new(session: IndexSession, provider: Arc<P>, config: RetrievalConfig) -> Self {
        Self {
            session,
            provider,
            config,
        }
    }

    /// Files relevant to `query`. Any failure, and an index that is not yet
    /// ready, yields an empty list.
    pub async fn retrieve(&self, query: &str) -> Vec<FileMatch> {
        if !self.session.is_ready() {
            tracing::debug!(
                progress = self.session.progress().ratio(),
                "index not ready, returning no matches"
            );
            return Vec::new();
        }
        let vector = match self.embed_query(query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("query embedding failed: {e:#}");
                return Vec::new();
            }
        };
        match self.search_vector(vector).await {
            Ok(matches) => matches,
            Err(e) => {
                tracing::warn!("codebase search failed: {e:#}");
                Vec::new()
            }
        }
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let timeout = self.config.embed_timeout;
        let mut vectors = tokio::time::timeout(timeout, self.provider.embed(&[query.to_owned()]))
            .await
            .map_err(|_| IndexError::Timeout(timeout.as_millis().try_into().unwrap_or(u64::MAX)))??;
        match vectors.pop() {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(IndexError::Provider {
                expected: 1,
                actual: 0,
            }),
        }
    }

    /// Search with a precomputed query vector.
    ///
    /// # Errors
    ///
    /// Returns an error if the projection search or file lookup fails.
    pub async fn search_vector(&self, vector: Vec<f32>) -> Result<Vec<FileMatch>> {
        let hits = self
            .session
            .projector()
            .query(vector, self.config.limit)
            .await?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let mut best: HashMap<&str, f32> = HashMap::new();
        for hit in &hits {
            best.entry(hit.chunk_hash.as_str())
                .and_modify(|d| *d = d.min(hit.distance))
                .or_insert(hit.distance);
        }
        let hashes: Vec<String> = hits.iter().map(|h| h.chunk_hash.clone()).collect();
        let root = self.session.root().to_string_lossy();
        let records = self
            .session
            .files()
            .query_by_chunk_hashes(&hashes, &root)
            .await?;

        let matches: Vec<FileMatch> = records
            .into_iter()
            .take(self.config.max_results)
            .map(|r| {
                let distance = r
                    .chunk_hashes
                    .iter()
                    .filter_map(|h| best.get(h.as_str()).copied())
                    .fold(f32::INFINITY, f32::min);
                FileMatch {
                    filepath: r.filepath,
                    name: r.name,
                    distance,
                    within_ceiling: distance <= self.config.distance_ceiling,
                }
            })
            .collect();

        let relevant = matches.iter().filter(|m| m.within_ceiling).count();
        tracing::debug!(
            hits = hits.len(),
            files = matches.len(),
            relevant,
            ceiling = self.config.distance_ceiling,
            "codebase search"
        );
        Ok(matches)
    }
}

/// Format matches as XML for injection into messages.
#[must_use]
pub fn format_as_context(matches: &[FileMatch]) -> String {
    if matches.is_empty() {
        return String::new();
    }

    let mut out = String::from("<codebase_context>\n");
    for m in matches {
        let _ = writeln!(
            out,
            "  <file path=\"{}\" name=\"{}\" distance=\"{:.3}\" />",
            m.filepath, m.name, m.distance,
        );
    }
    out.push_str("</codebase_context>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_empty_is_empty() {
        assert_eq!(format_as_context(&[]), "");
    }

    #[test]
    fn format_lists_files() {
        let out = format_as_context(&[FileMatch {
            filepath: "/ws/src/lib.rs".into(),
            name: "lib.rs".into(),
            distance: 0.1234,
            within_ceiling: true,
        }]);
        assert!(out.starts_with("<codebase_context>\n"));
        assert!(out.contains("path=\"/ws/src/lib.rs\""));
        assert!(out.contains("distance=\"0.123\""));
        assert!(out.ends_with("</codebase_context>"));
    }

    #[test]
    fn default_config() {
        let c = RetrievalConfig::default();
        assert_eq!(c.limit, 10);
        assert_eq!(c.max_results, 10);
        assert!((c.distance_ceiling - 0.5).abs() < f32::EPSILON);
    }
}
