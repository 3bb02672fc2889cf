//! Multi-source search: fan out, fuse, deduplicate, store.
//!
//! Each selected source is called concurrently. Per source the order is:
//! cache lookup, then the breaker reserves the call (`try_begin_call`), then
//! rate-limiter token, then the call itself under the source's timeout, then
//! exactly one of `record_success` / `record_failure`. A failing source never fails the
//! search; the rest of the sources still contribute.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::SearchCache;
use crate::circuit::CircuitBreakerRegistry;
use crate::dedup::{DedupVerdict, Deduplicator, DEFAULT_TITLE_THRESHOLD};
use crate::models::{CandidateRecord, QueryLogEntry, QueryPlan, SearchQuery};
use crate::policy::PolicySet;
use crate::ranking::{reciprocal_rank_fusion, FusedRecord, DEFAULT_RRF_K};
use crate::rate_limit::RateLimiterRegistry;
use crate::source::{Source, SourceError, SourceRegistry};
use crate::store::{CatalogStore, InsertOutcome};

pub const DEFAULT_MAX_RESULTS: usize = 100;

/// Global tuning for the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub rrf_k: u32,
    pub title_threshold: f64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            rrf_k: DEFAULT_RRF_K,
            title_threshold: DEFAULT_TITLE_THRESHOLD,
        }
    }
}

/// One multi-source query.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub max_results: usize,
    pub year_start: Option<i32>,
    pub year_end: Option<i32>,
    /// `None` means every registered source.
    pub sources: Option<Vec<String>>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            max_results: DEFAULT_MAX_RESULTS,
            year_start: None,
            year_end: None,
            sources: None,
        }
    }

    pub fn from_plan(plan: &QueryPlan, max_results: usize) -> Self {
        Self {
            query: plan.query.clone(),
            max_results,
            year_start: plan.year_start,
            year_end: plan.year_end,
            sources: if plan.target_sources.is_empty() {
                None
            } else {
                Some(plan.target_sources.clone())
            },
        }
    }

    pub fn max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn years(mut self, start: Option<i32>, end: Option<i32>) -> Self {
        self.year_start = start;
        self.year_end = end;
        self
    }

    pub fn sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = Some(sources.into_iter().map(Into::into).collect());
        self
    }

    fn source_query(&self) -> SearchQuery {
        SearchQuery {
            query: self.query.clone(),
            max_results: self.max_results,
            year_start: self.year_start,
            year_end: self.year_end,
        }
    }

    fn cache_params(&self) -> Value {
        json!({
            "year_start": self.year_start,
            "year_end": self.year_end,
            "max_results": self.max_results,
        })
    }
}

/// Counters from one `search_and_store` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub new_count: usize,
    pub updated_count: usize,
    /// Size of the fused list before deduplication.
    pub results_returned: usize,
    pub sources_attempted: usize,
    pub sources_responded: usize,
    pub sources_failed: usize,
}

impl StoreSummary {
    /// No source produced an answer, either because every attempted call
    /// failed or because nothing could be attempted.
    pub fn all_sources_failed(&self) -> bool {
        self.sources_responded == 0
    }
}

enum SourceOutcome {
    Responded(Vec<CandidateRecord>),
    Failed,
    /// The breaker refused the call after the source was selected.
    Skipped,
}

struct Gathered {
    lists: Vec<Vec<CandidateRecord>>,
    attempted: Vec<String>,
    responded: usize,
    failed: usize,
}

struct CatalogIndex {
    dedup: Deduplicator,
    loaded: bool,
}

pub struct Orchestrator<S> {
    sources: SourceRegistry,
    store: Arc<S>,
    rate_limits: Arc<RateLimiterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: Option<Arc<dyn SearchCache>>,
    policies: PolicySet,
    settings: OrchestratorSettings,
    /// Held across check, insert and register so two concurrent
    /// checkpoints cannot both store the same record.
    index: Mutex<CatalogIndex>,
}

impl<S: CatalogStore> Orchestrator<S> {
    pub fn new(sources: SourceRegistry, store: Arc<S>, settings: OrchestratorSettings) -> Self {
        let policies = PolicySet::new();
        Self {
            sources,
            store,
            rate_limits: Arc::new(RateLimiterRegistry::from_policies(&policies)),
            breakers: Arc::new(CircuitBreakerRegistry::from_policies(&policies)),
            cache: None,
            index: Mutex::new(CatalogIndex {
                dedup: Deduplicator::new(settings.title_threshold),
                loaded: false,
            }),
            policies,
            settings,
        }
    }

    /// Use `policies` for timeouts and cache lifetimes, and build fresh
    /// registries from them.
    pub fn with_policies(mut self, policies: PolicySet) -> Self {
        self.rate_limits = Arc::new(RateLimiterRegistry::from_policies(&policies));
        self.breakers = Arc::new(CircuitBreakerRegistry::from_policies(&policies));
        self.policies = policies;
        self
    }

    /// Share existing registries, e.g. across several orchestrators.
    pub fn with_registries(
        mut self,
        rate_limits: Arc<RateLimiterRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        self.rate_limits = rate_limits;
        self.breakers = breakers;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn SearchCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn rate_limits(&self) -> &Arc<RateLimiterRegistry> {
        &self.rate_limits
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.names()
    }

    /// Re-read the catalog into the deduplicator.
    pub async fn reload_catalog(&self) -> Result<usize> {
        let mut index = self.index.lock().await;
        self.load_into(&mut index).await
    }

    async fn ensure_catalog_loaded(&self) -> Result<()> {
        let mut index = self.index.lock().await;
        if !index.loaded {
            self.load_into(&mut index).await?;
        }
        Ok(())
    }

    async fn load_into(&self, index: &mut CatalogIndex) -> Result<usize> {
        let snapshot = self.store.catalog_snapshot().await?;
        index.dedup.load_existing(&snapshot);
        index.loaded = true;
        info!(records = snapshot.len(), "catalog loaded for deduplication");
        Ok(snapshot.len())
    }

    /// Fused, deduplicated results that are not already in the catalog.
    /// Nothing is stored.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<CandidateRecord>> {
        let gathered = self.gather(request).await;
        let fused = reciprocal_rank_fusion(&gathered.lists, self.settings.rrf_k);
        self.ensure_catalog_loaded().await?;

        // Kept records are registered on a scratch copy so near-identical
        // titles inside one result list collapse to the first one.
        let mut seen = self.index.lock().await.dedup.clone();
        Ok(seen.retain_unique(fused.into_iter().map(|item| item.record)))
    }

    /// Search, then persist every fused record that is not a duplicate.
    ///
    /// Duplicates, whether caught by the deduplicator or by the store's
    /// identifier constraint, count as updated and have the contributing
    /// sources added. With a `run_id`, an audit row is logged.
    pub async fn search_and_store(
        &self,
        request: &SearchRequest,
        run_id: Option<i64>,
    ) -> Result<StoreSummary> {
        let gathered = self.gather(request).await;
        let fused = reciprocal_rank_fusion(&gathered.lists, self.settings.rrf_k);
        let mut summary = StoreSummary {
            results_returned: fused.len(),
            sources_attempted: gathered.attempted.len(),
            sources_responded: gathered.responded,
            sources_failed: gathered.failed,
            ..Default::default()
        };
        self.ensure_catalog_loaded().await?;

        {
            let mut index = self.index.lock().await;
            for item in &fused {
                match index.dedup.is_duplicate(&item.record) {
                    DedupVerdict::Duplicate { existing_id } => {
                        summary.updated_count += 1;
                        if let Some(id) = existing_id {
                            self.attribute(id, item).await?;
                        }
                    }
                    DedupVerdict::Unique => match self.store.insert_record(&item.record).await? {
                        InsertOutcome::Inserted(id) => {
                            summary.new_count += 1;
                            index.dedup.register(&item.record, Some(id));
                            self.attribute(id, item).await?;
                        }
                        InsertOutcome::Duplicate(existing_id) => {
                            summary.updated_count += 1;
                            index.dedup.register(&item.record, existing_id);
                            if let Some(id) = existing_id {
                                self.attribute(id, item).await?;
                            }
                        }
                    },
                }
            }
        }

        if let Some(run_id) = run_id {
            self.store
                .log_query(&QueryLogEntry {
                    run_id,
                    query_text: request.query.clone(),
                    sources: gathered.attempted.clone(),
                    results_returned: summary.results_returned as i64,
                    new_records: summary.new_count as i64,
                })
                .await?;
        }

        info!(
            query = %request.query,
            new = summary.new_count,
            updated = summary.updated_count,
            responded = summary.sources_responded,
            failed = summary.sources_failed,
            "query stored"
        );
        Ok(summary)
    }

    /// Look a record up on one named source, through the same rate limiter
    /// and breaker as searches. `Ok(None)` when the breaker is open.
    pub async fn fetch_by_identifier(
        &self,
        source_name: &str,
        identifier: &str,
    ) -> Result<Option<CandidateRecord>> {
        let source = self
            .sources
            .get(source_name)
            .ok_or_else(|| anyhow!("unknown source '{}'", source_name))?;
        if !self.breakers.try_begin_call(source_name) {
            debug!(source = source_name, "circuit open, skipping identifier lookup");
            return Ok(None);
        }

        let timeout = self.policies.get(source_name).timeout;
        self.rate_limits.acquire(source_name).await;
        let result = match tokio::time::timeout(timeout, source.get_by_identifier(identifier)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(timeout)),
        };
        match result {
            Ok(found) => {
                self.breakers.record_success(source_name);
                Ok(found.map(|mut record| {
                    record.source = source_name.to_string();
                    record
                }))
            }
            Err(SourceError::Unsupported(_)) => {
                self.breakers.record_success(source_name);
                Ok(None)
            }
            Err(e) => {
                self.breakers.record_failure(source_name);
                Err(anyhow!(e).context(format!("identifier lookup on {}", source_name)))
            }
        }
    }

    async fn attribute(&self, record_id: i64, item: &FusedRecord) -> Result<()> {
        for source in &item.sources {
            self.store.add_record_source(record_id, source).await?;
        }
        Ok(())
    }

    fn selected_sources(&self, request: &SearchRequest) -> Vec<&dyn Source> {
        match &request.sources {
            None => self.sources.sources().iter().map(|s| s.as_ref()).collect(),
            Some(names) => {
                let wanted: BTreeSet<&str> = names.iter().map(String::as_str).collect();
                for name in &wanted {
                    if self.sources.get(name).is_none() {
                        debug!(source = name, "requested source is not registered");
                    }
                }
                self.sources
                    .sources()
                    .iter()
                    .filter(|s| wanted.contains(s.name()))
                    .map(|s| s.as_ref())
                    .collect()
            }
        }
    }

    async fn gather(&self, request: &SearchRequest) -> Gathered {
        let mut attempted = Vec::new();
        let mut calls = Vec::new();
        for source in self.selected_sources(request) {
            if !self.breakers.is_available(source.name()) {
                debug!(source = source.name(), "circuit open, skipping");
                continue;
            }
            attempted.push(source.name().to_string());
            calls.push(self.query_source(source, request));
        }

        let mut gathered = Gathered {
            lists: Vec::new(),
            attempted,
            responded: 0,
            failed: 0,
        };
        for outcome in join_all(calls).await {
            match outcome {
                SourceOutcome::Responded(records) => {
                    gathered.responded += 1;
                    if !records.is_empty() {
                        gathered.lists.push(records);
                    }
                }
                SourceOutcome::Failed => gathered.failed += 1,
                SourceOutcome::Skipped => {}
            }
        }
        gathered
    }

    async fn query_source(&self, source: &dyn Source, request: &SearchRequest) -> SourceOutcome {
        let name = source.name();
        let policy = self.policies.get(name);
        let params = request.cache_params();

        if let Some(cache) = &self.cache {
            match cache.get(name, &request.query, &params).await {
                Ok(Some(records)) => {
                    debug!(source = name, query = %request.query, hits = records.len(), "cache hit");
                    return SourceOutcome::Responded(records);
                }
                Ok(None) => {}
                Err(e) => warn!(source = name, error = %e, "cache read failed"),
            }
        }

        if !self.breakers.try_begin_call(name) {
            debug!(source = name, "circuit refused call, skipping");
            return SourceOutcome::Skipped;
        }
        self.rate_limits.acquire(name).await;
        let result = match tokio::time::timeout(policy.timeout, source.search(&request.source_query())).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(policy.timeout)),
        };

        match result {
            Ok(response) => {
                self.breakers.record_success(name);
                let mut records = response.records;
                records.truncate(request.max_results);
                for record in &mut records {
                    record.source = name.to_string();
                }
                debug!(source = name, query = %request.query, hits = records.len(), "source responded");
                if !records.is_empty() {
                    if let Some(cache) = &self.cache {
                        let ttl: Option<Duration> = Some(policy.cache_ttl);
                        if let Err(e) = cache.set(name, &request.query, &records, &params, ttl).await {
                            warn!(source = name, error = %e, "cache write failed");
                        }
                    }
                }
                SourceOutcome::Responded(records)
            }
            Err(e) => {
                self.breakers.record_failure(name);
                warn!(source = name, query = %request.query, error = %e, "source search failed");
                SourceOutcome::Failed
            }
        }
    }
}
