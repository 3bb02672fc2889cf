//! The source capability trait and the registry of configured sources.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             SourceRegistry               │
//! │  ┌─────────┐ ┌─────────┐ ┌────────────┐  │
//! │  │openalex │ │crossref │ │    ...     │  │
//! │  └─────────┘ └─────────┘ └────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!        Orchestrator::search() fan-out
//! ```

use std::time::Duration;

use async_trait::async_trait;

use crate::models::{CandidateRecord, SearchQuery, SearchResponse};

/// Why a source call failed. Every variant counts as a breaker failure.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not parse response: {0}")]
    Parse(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

// ═══════════════════════════════════════════════════════════════════════
// Source Trait
// ═══════════════════════════════════════════════════════════════════════

/// Something that can be searched for candidate records.
///
/// Implementations return an empty response for "no results" and reserve
/// errors for transport or parse failures.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use harvest_core::models::{SearchQuery, SearchResponse};
/// use harvest_core::source::{Source, SourceError};
///
/// struct Silent;
///
/// #[async_trait]
/// impl Source for Silent {
///     fn name(&self) -> &str { "silent" }
///
///     async fn search(&self, _query: &SearchQuery) -> Result<SearchResponse, SourceError> {
///         Ok(SearchResponse::default())
///     }
/// }
/// ```
#[async_trait]
pub trait Source: Send + Sync {
    /// Stable key for rate limiting, breaking and caching.
    fn name(&self) -> &str;

    async fn search(&self, query: &SearchQuery) -> Result<SearchResponse, SourceError>;

    /// Look up a single record. Sources without this capability return
    /// `Ok(None)`.
    async fn get_by_identifier(
        &self,
        _identifier: &str,
    ) -> Result<Option<CandidateRecord>, SourceError> {
        Ok(None)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Source Registry
// ═══════════════════════════════════════════════════════════════════════

/// The fixed set of sources registered at startup.
pub struct SourceRegistry {
    sources: Vec<Box<dyn Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    /// Register a source. A later registration with the same name replaces
    /// the earlier one.
    pub fn register(&mut self, source: Box<dyn Source>) {
        self.sources.retain(|s| s.name() != source.name());
        self.sources.push(source);
    }

    pub fn with(mut self, source: impl Source + 'static) -> Self {
        self.register(Box::new(source));
        self
    }

    pub fn get(&self, name: &str) -> Option<&dyn Source> {
        self.sources
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.as_ref())
    }

    pub fn sources(&self) -> &[Box<dyn Source>] {
        &self.sources
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Source for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn search(&self, _query: &SearchQuery) -> Result<SearchResponse, SourceError> {
            Ok(SearchResponse::default())
        }
    }

    #[test]
    fn registry_replaces_same_name() {
        let registry = SourceRegistry::new()
            .with(Named("openalex"))
            .with(Named("crossref"))
            .with(Named("openalex"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["crossref", "openalex"]);
        assert!(registry.get("crossref").is_some());
        assert!(registry.get("arxiv").is_none());
    }

    #[tokio::test]
    async fn identifier_lookup_defaults_to_none() {
        let source = Named("openalex");
        assert!(source.get_by_identifier("10.1/x").await.unwrap().is_none());
    }

    #[test]
    fn timeout_error_message() {
        let err = SourceError::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "timed out after 30s");
    }
}
