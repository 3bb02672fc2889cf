use anyhow::{Context, Result};
use harvest_core::dedup::DEFAULT_TITLE_THRESHOLD;
use harvest_core::orchestrator::OrchestratorSettings;
use harvest_core::policy::{PolicySet, SourcePolicy};
use harvest_core::ranking::DEFAULT_RRF_K;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_size_limit_bytes")]
    pub size_limit_bytes: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            ttl_secs: default_cache_ttl_secs(),
            size_limit_bytes: default_size_limit_bytes(),
            enabled: true,
        }
    }
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("./data/cache.sqlite")
}
fn default_cache_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}
fn default_size_limit_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_results")]
    pub max_results_per_query: usize,
    /// Seconds before a resume treats an `in_progress` checkpoint as
    /// abandoned.
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_results_per_query: default_max_results(),
            claim_lease_secs: default_claim_lease_secs(),
        }
    }
}

fn default_concurrency() -> usize {
    3
}
fn default_max_results() -> usize {
    100
}
fn default_claim_lease_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_title_threshold")]
    pub title_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            title_threshold: default_title_threshold(),
        }
    }
}

fn default_title_threshold() -> f64 {
    DEFAULT_TITLE_THRESHOLD
}

#[derive(Debug, Deserialize, Clone)]
pub struct RankingConfig {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: u32,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
        }
    }
}

fn default_rrf_k() -> u32 {
    DEFAULT_RRF_K
}

/// Per-source tuning, `[sources.<name>]`.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_rate_qps")]
    pub rate_qps: f64,
    #[serde(default)]
    pub burst: Option<u32>,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_rate_qps() -> f64 {
    1.0
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_secs() -> u64 {
    60
}
fn default_half_open_max_calls() -> u32 {
    1
}
fn default_timeout_secs() -> u64 {
    30
}

impl SourceConfig {
    pub fn policy(&self) -> SourcePolicy {
        SourcePolicy {
            rate_qps: self.rate_qps,
            burst: self.burst,
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            half_open_max_calls: self.half_open_max_calls,
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

impl Config {
    /// Policies for every configured source.
    pub fn policies(&self) -> PolicySet {
        let mut set = PolicySet::new();
        for (name, source) in &self.sources {
            set.insert(name.clone(), source.policy());
        }
        set
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            rrf_k: self.ranking.rrf_k,
            title_threshold: self.dedup.title_threshold,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.batch.concurrency < 1 {
        anyhow::bail!("batch.concurrency must be >= 1");
    }

    if config.batch.max_results_per_query < 1 {
        anyhow::bail!("batch.max_results_per_query must be >= 1");
    }

    if !(0.0..=100.0).contains(&config.dedup.title_threshold) {
        anyhow::bail!("dedup.title_threshold must be in [0, 100]");
    }

    if config.ranking.rrf_k < 1 {
        anyhow::bail!("ranking.rrf_k must be >= 1");
    }

    for (name, source) in &config.sources {
        if !(source.rate_qps.is_finite() && source.rate_qps > 0.0) {
            anyhow::bail!("sources.{}.rate_qps must be > 0", name);
        }
        if source.failure_threshold < 1 {
            anyhow::bail!("sources.{}.failure_threshold must be >= 1", name);
        }
        if source.half_open_max_calls < 1 {
            anyhow::bail!("sources.{}.half_open_max_calls must be >= 1", name);
        }
    }

    Ok(())
}
