//! Search provider interface.
//!
//! Providers are external collaborators; the core only defines the contract
//! the Retrieve node fans out over, plus an in-process static provider for
//! tests and offline development. Each provider call runs under its own
//! timeout, and the fan-out is capped so a slow provider cannot stall the
//! pipeline.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{RetrievedDocument, SearchFilters};

/// A search query as seen by providers.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// Free-text query.
    pub query: String,
    /// Result filters.
    pub filters: SearchFilters,
    /// Maximum results wanted from this provider.
    pub max_results: usize,
}

/// An external search provider.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Run the query, returning ranked documents.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RetrievedDocument>>;

    /// Provider name for logs and source tags.
    fn name(&self) -> &str;
}

/// A canned provider serving fixed documents; used in tests and as an
/// offline stub.
pub struct StaticSearchProvider {
    name: String,
    documents: Vec<RetrievedDocument>,
}

impl StaticSearchProvider {
    /// Build a provider that always returns `documents`.
    #[must_use]
    pub fn new(name: impl Into<String>, documents: Vec<RetrievedDocument>) -> Self {
        Self {
            name: name.into(),
            documents,
        }
    }
}

#[async_trait]
impl SearchProvider for StaticSearchProvider {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RetrievedDocument>> {
        let mut documents: Vec<RetrievedDocument> = self
            .documents
            .iter()
            .filter(|doc| {
                query.filters.allowed_sources.is_empty()
                    || query
                        .filters
                        .allowed_sources
                        .iter()
                        .any(|source| doc.url.contains(source.as_str()))
            })
            .cloned()
            .collect();
        documents.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        documents.truncate(query.max_results);
        Ok(documents)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(url: &str, score: f64) -> RetrievedDocument {
        RetrievedDocument {
            title: url.to_string(),
            url: url.to_string(),
            snippet: "snippet".into(),
            score,
        }
    }

    #[tokio::test]
    async fn test_static_provider_ranks_and_truncates() {
        let provider = StaticSearchProvider::new(
            "static",
            vec![doc("https://a", 0.2), doc("https://b", 0.9), doc("https://c", 0.5)],
        );
        let results = provider
            .search(&SearchQuery {
                query: "q".into(),
                filters: SearchFilters::default(),
                max_results: 2,
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].url, "https://b");
    }

    #[tokio::test]
    async fn test_source_allowlist_filters() {
        let provider = StaticSearchProvider::new(
            "static",
            vec![doc("https://docs.rs/lru", 0.9), doc("https://example.com", 0.8)],
        );
        let results = provider
            .search(&SearchQuery {
                query: "q".into(),
                filters: SearchFilters {
                    recency_days: None,
                    allowed_sources: vec!["docs.rs".into()],
                },
                max_results: 10,
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].url.contains("docs.rs"));
    }
}
