//! # Catalog Harvest CLI (`harvest`)
//!
//! The `harvest` binary is the operator's view of the catalog database: it
//! initializes the schema, inspects and repairs batch runs, and maintains the
//! search cache. Batches themselves are driven by programs that supply source
//! adapters through [`catalog_harvest::context::HarvestContext`].
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest init` | Create the SQLite database and run schema migrations |
//! | `harvest runs` | List recent runs, newest first |
//! | `harvest progress <run_id>` | Checkpoint progress of one run |
//! | `harvest reset-failed <run_id>` | Return failed checkpoints to pending |
//! | `harvest interrupt <run_id>` | Mark a run interrupted so it can be resumed |
//! | `harvest release-claims <run_id>` | Return in-progress checkpoints to pending |
//! | `harvest refresh-window` | Year an incremental refresh would start from |
//! | `harvest sources` | Configured per-source policies |
//! | `harvest cache stats` | Entry count and payload size of the search cache |
//! | `harvest cache clear` | Drop every cache entry |
//!
//! Logs go to stderr and honor `RUST_LOG`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use catalog_harvest::config::{self, Config};
use catalog_harvest::context::HarvestContext;
use catalog_harvest::migrate;
use catalog_harvest::progress::render_progress;
use catalog_harvest::sqlite_cache::SqliteCache;
use harvest_core::batch::refresh_since_year;
use harvest_core::cache::SearchCache;
use harvest_core::models::Run;
use harvest_core::store::LedgerStore;

/// Catalog Harvest CLI: resumable multi-source ingestion into one
/// deduplicated catalog.
#[derive(Parser)]
#[command(name = "harvest", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/harvest.toml`.
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it again on an existing database is safe.
    Init,

    /// List recent runs, newest first.
    Runs {
        /// Maximum number of runs to show.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show checkpoint progress for a run.
    Progress {
        run_id: i64,
    },

    /// Move a run's failed checkpoints back to pending.
    ResetFailed {
        run_id: i64,
    },

    /// Mark a run interrupted so the next resume picks it up.
    Interrupt {
        run_id: i64,
    },

    /// Return a run's in-progress checkpoints to pending.
    ///
    /// Use after a crashed worker when no other driver is running the run.
    ReleaseClaims {
        run_id: i64,
        /// Only release claims at least this many seconds old.
        #[arg(long, default_value_t = 0)]
        older_than: u64,
    },

    /// Print the year an incremental refresh would start from.
    RefreshWindow {
        /// Explicit start, `YYYY` or `YYYY-MM-DD`.
        #[arg(long)]
        since: Option<String>,
    },

    /// List configured sources and their policies.
    Sources,

    /// Inspect or clear the search cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Entry count and stored payload size.
    Stats,
    /// Remove every entry.
    Clear,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("catalog_harvest=info,harvest_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn print_run(run: &Run) {
    let finished = run
        .completed_at
        .map(format_timestamp)
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:>5}  {:<20}  {:<12}  {}  {:<19}  {:>6} queries  {:>6} added  {:>6} updated",
        run.id,
        run.run_type,
        run.status.as_str(),
        format_timestamp(run.started_at),
        finished,
        run.queries_executed,
        run.records_added,
        run.records_updated
    );
}

async fn open_context(cfg: Config) -> anyhow::Result<HarvestContext> {
    HarvestContext::open(cfg)
        .await
        .context("Failed to open catalog database")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Runs { limit } => {
            let ctx = open_context(cfg).await?;
            let runs = ctx.store().list_runs(limit).await?;
            if runs.is_empty() {
                println!("No runs recorded.");
            }
            for run in &runs {
                print_run(run);
            }
        }
        Commands::Progress { run_id } => {
            let ctx = open_context(cfg).await?;
            let run = ctx
                .store()
                .get_run(run_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("run not found: {}", run_id))?;
            let progress = ctx.store().get_checkpoint_progress(run_id).await?;
            println!("{}", render_progress(run_id, &progress));
            println!("status: {}", run.status);
        }
        Commands::ResetFailed { run_id } => {
            let ctx = open_context(cfg).await?;
            let reset = ctx.store().reset_failed_checkpoints(run_id).await?;
            println!("Reset {} failed checkpoint(s) in run {}.", reset, run_id);
        }
        Commands::Interrupt { run_id } => {
            let ctx = open_context(cfg).await?;
            if ctx.store().get_run(run_id).await?.is_none() {
                anyhow::bail!("run not found: {}", run_id);
            }
            ctx.store().interrupt_search_run(run_id).await?;
            println!("Run {} marked interrupted.", run_id);
        }
        Commands::ReleaseClaims { run_id, older_than } => {
            let ctx = open_context(cfg).await?;
            let released = ctx
                .store()
                .release_stale_claims(run_id, Duration::from_secs(older_than))
                .await?;
            println!("Released {} claimed checkpoint(s) in run {}.", released, run_id);
        }
        Commands::RefreshWindow { since } => {
            let ctx = open_context(cfg).await?;
            let year = refresh_since_year(ctx.store().as_ref(), since.as_deref()).await?;
            println!("{}", year);
        }
        Commands::Sources => {
            if cfg.sources.is_empty() {
                println!("No sources configured; every source uses default policy.");
            }
            for (name, source) in &cfg.sources {
                let policy = source.policy();
                println!(
                    "{:<16} {:>6.2} qps  burst {:<4} breaker {}/{}s  cache ttl {}s  timeout {}s",
                    name,
                    policy.rate_qps,
                    policy
                        .burst
                        .map(|b| b.to_string())
                        .unwrap_or_else(|| "auto".to_string()),
                    policy.failure_threshold,
                    policy.recovery_timeout.as_secs(),
                    policy.cache_ttl.as_secs(),
                    policy.timeout.as_secs()
                );
            }
        }
        Commands::Cache { action } => {
            let cache = SqliteCache::from_config(&cfg.cache)
                .await
                .context("Failed to open cache database")?;
            match action {
                CacheAction::Stats => {
                    let stats = cache.stats().await?;
                    println!("entries: {}", stats.entries);
                    println!("bytes:   {}", stats.bytes);
                }
                CacheAction::Clear => {
                    let removed = cache.clear().await?;
                    println!("Removed {} cache entr{}.", removed, if removed == 1 { "y" } else { "ies" });
                }
            }
        }
    }

    Ok(())
}
