//! Process-level wiring: one catalog/ledger store, one optional cache, and
//! shared rate-limiter and breaker registries built from configuration.
//!
//! Adapters are supplied by the caller as a [`SourceRegistry`]; every
//! orchestrator built from the same context shares the registries, so two
//! batches running side by side still respect one per-source pace.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use harvest_core::batch::{BatchDriver, BatchOptions};
use harvest_core::circuit::CircuitBreakerRegistry;
use harvest_core::orchestrator::Orchestrator;
use harvest_core::rate_limit::RateLimiterRegistry;
use harvest_core::source::SourceRegistry;
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::progress::ProgressMode;
use crate::sqlite_cache::SqliteCache;
use crate::sqlite_store::SqliteStore;

pub struct HarvestContext {
    config: Config,
    store: Arc<SqliteStore>,
    cache: Option<Arc<SqliteCache>>,
    rate_limits: Arc<RateLimiterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl HarvestContext {
    /// Connect to the catalog database (migrating it) and, when enabled,
    /// the cache database.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config.db.path).await?;
        migrate::apply(&pool).await?;

        let cache = if config.cache.enabled {
            Some(Arc::new(SqliteCache::from_config(&config.cache).await?))
        } else {
            None
        };

        let policies = config.policies();
        info!(
            db = %config.db.path.display(),
            cache = config.cache.enabled,
            sources = policies.len(),
            "harvest context opened"
        );

        Ok(Self {
            store: Arc::new(SqliteStore::new(pool)),
            cache,
            rate_limits: Arc::new(RateLimiterRegistry::from_policies(&policies)),
            breakers: Arc::new(CircuitBreakerRegistry::from_policies(&policies)),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn cache(&self) -> Option<&Arc<SqliteCache>> {
        self.cache.as_ref()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn orchestrator(&self, sources: SourceRegistry) -> Orchestrator<SqliteStore> {
        let orchestrator = Orchestrator::new(
            sources,
            self.store.clone(),
            self.config.orchestrator_settings(),
        )
        .with_policies(self.config.policies())
        .with_registries(self.rate_limits.clone(), self.breakers.clone());

        match &self.cache {
            Some(cache) => orchestrator.with_cache(cache.clone()),
            None => orchestrator,
        }
    }

    pub fn batch_driver(&self, sources: SourceRegistry, progress: ProgressMode) -> BatchDriver<SqliteStore> {
        BatchDriver::new(Arc::new(self.orchestrator(sources)))
            .with_reporter(progress.reporter())
            .with_max_results(self.config.batch.max_results_per_query)
    }

    /// Batch options with the configured concurrency and claim lease.
    pub fn batch_options(&self, run_type: &str, resume: bool) -> BatchOptions {
        BatchOptions {
            run_type: run_type.to_string(),
            resume,
            concurrency: self.config.batch.concurrency,
            claim_lease: Duration::from_secs(self.config.batch.claim_lease_secs),
            ..Default::default()
        }
    }
}
