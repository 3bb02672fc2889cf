//! Checkpointed batch execution.
//!
//! Every planned query is seeded into the ledger as a checkpoint under a
//! run, then pending checkpoints are processed under a concurrency limit.
//! A worker claims a checkpoint (`pending → in_progress`) before running
//! it, so drivers resuming the same run never execute a query twice.
//! A killed or cancelled batch leaves its run `running` or `interrupted`
//! with untouched checkpoints still pending; the next resume picks those
//! up, retries the failed ones and releases claims older than the lease.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::{
    Checkpoint, CheckpointCounts, CheckpointStatus, QueryPlan, RunTotals, RUN_TYPE_HISTORICAL,
};
use crate::orchestrator::{Orchestrator, SearchRequest, DEFAULT_MAX_RESULTS};
use crate::progress::{BatchProgressEvent, BatchProgressReporter, NoProgress};
use crate::store::{CatalogStore, LedgerStore};

pub const DEFAULT_CONCURRENCY: usize = 3;

/// Claims older than this are presumed dead when a run is resumed.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub run_type: String,
    /// Continue the last incomplete run of `run_type` instead of starting
    /// a new one.
    pub resume: bool,
    pub concurrency: usize,
    /// Process at most this many pending checkpoints in this session.
    pub max_queries: Option<usize>,
    /// Age after which a resume returns an `in_progress` checkpoint to
    /// pending.
    pub claim_lease: Duration,
    pub cancel: CancellationToken,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            run_type: RUN_TYPE_HISTORICAL.to_string(),
            resume: false,
            concurrency: DEFAULT_CONCURRENCY,
            max_queries: None,
            claim_lease: DEFAULT_CLAIM_LEASE,
            cancel: CancellationToken::new(),
        }
    }
}

/// What one `run` call did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub run_id: i64,
    /// Checkpoints processed in this session.
    pub total_queries: u64,
    pub records_added: i64,
    pub records_updated: i64,
    /// Checkpoints whose execution raised an error.
    pub errors: u64,
    /// Checkpoints marked failed, including errors.
    pub failed: u64,
    /// Checkpoints another worker claimed or finished first.
    pub skipped: u64,
    pub interrupted: bool,
    pub resumed: bool,
    pub elapsed: Duration,
}

enum CheckpointOutcome {
    Completed(CheckpointCounts),
    Failed,
    Errored,
    Skipped,
}

pub struct BatchDriver<S> {
    orchestrator: Arc<Orchestrator<S>>,
    reporter: Arc<dyn BatchProgressReporter>,
    max_results: usize,
}

impl<S> BatchDriver<S>
where
    S: CatalogStore + LedgerStore + 'static,
{
    pub fn new(orchestrator: Arc<Orchestrator<S>>) -> Self {
        Self {
            orchestrator,
            reporter: Arc::new(NoProgress),
            max_results: DEFAULT_MAX_RESULTS,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn BatchProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    /// Seed `plans` and work through the run's pending checkpoints.
    ///
    /// An error escaping the batch marks the run `failed`. Errors inside a
    /// single checkpoint only fail that checkpoint.
    pub async fn run(&self, plans: Vec<QueryPlan>, options: BatchOptions) -> Result<BatchSummary> {
        let store = self.orchestrator.store();
        let (run_id, resumed) = self.open_run(&options).await?;

        match self.execute(run_id, resumed, plans, &options).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!(run_id, error = %e, "batch failed");
                if let Err(mark) = store.fail_run(run_id).await {
                    warn!(run_id, error = %mark, "could not mark run failed");
                }
                Err(e)
            }
        }
    }

    async fn open_run(&self, options: &BatchOptions) -> Result<(i64, bool)> {
        let store = self.orchestrator.store();
        let existing = store.get_last_incomplete_run(&options.run_type).await?;

        match existing {
            Some(run) if options.resume => {
                let reset = store.reset_failed_checkpoints(run.id).await?;
                let released = store.release_stale_claims(run.id, options.claim_lease).await?;
                info!(run_id = run.id, status = %run.status, reset, released, "resuming run");
                Ok((run.id, true))
            }
            Some(run) => {
                warn!(run_id = run.id, "abandoning incomplete run, starting fresh");
                store.fail_run(run.id).await?;
                Ok((store.start_run(&options.run_type).await?, false))
            }
            None => {
                if options.resume {
                    info!(run_type = %options.run_type, "nothing to resume, starting fresh");
                }
                Ok((store.start_run(&options.run_type).await?, false))
            }
        }
    }

    async fn execute(
        &self,
        run_id: i64,
        resumed: bool,
        plans: Vec<QueryPlan>,
        options: &BatchOptions,
    ) -> Result<BatchSummary> {
        let started = Instant::now();
        let store = self.orchestrator.store().clone();
        self.orchestrator
            .reload_catalog()
            .await
            .context("loading catalog for deduplication")?;

        let specs: Vec<_> = plans.iter().map(QueryPlan::to_spec).collect();
        let mut by_hash: HashMap<String, QueryPlan> = HashMap::with_capacity(plans.len());
        for plan in plans {
            by_hash.entry(plan.hash()).or_insert(plan);
        }

        let seeded = store
            .insert_checkpoint_batch(run_id, &specs)
            .await
            .context("seeding checkpoints")?;
        let mut pending = store.get_pending_checkpoints(run_id).await?;
        if let Some(max) = options.max_queries {
            pending.truncate(max);
        }
        let total = pending.len() as u64;
        info!(run_id, seeded, pending = total, resumed, "batch started");
        self.reporter.report(BatchProgressEvent::Started {
            run_id,
            seeded,
            pending: total,
            resumed,
        });

        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let done = Arc::new(AtomicU64::new(0));
        let mut tasks = JoinSet::new();
        let mut interrupted = false;

        for checkpoint in pending {
            let permit = tokio::select! {
                biased;
                _ = options.cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                permit = semaphore.clone().acquire_owned() => permit.context("batch semaphore closed")?,
            };
            let plan = by_hash.get(&checkpoint.query_hash).cloned();
            let orchestrator = self.orchestrator.clone();
            let reporter = self.reporter.clone();
            let done = done.clone();
            let max_results = self.max_results;
            tasks.spawn(async move {
                let _permit = permit;
                let query = checkpoint.query_text.clone();
                let outcome = process_checkpoint(&orchestrator, run_id, checkpoint, plan, max_results).await;
                if matches!(outcome, CheckpointOutcome::Skipped) {
                    return outcome;
                }
                let (status, counts) = match &outcome {
                    CheckpointOutcome::Completed(counts) => (CheckpointStatus::Completed, *counts),
                    _ => (CheckpointStatus::Failed, CheckpointCounts::default()),
                };
                reporter.report(BatchProgressEvent::Checkpoint {
                    run_id,
                    query,
                    status,
                    new_found: counts.new_found,
                    updated_found: counts.updated_found,
                    done: done.fetch_add(1, Ordering::SeqCst) + 1,
                    total,
                });
                outcome
            });
        }

        if interrupted {
            info!(run_id, in_flight = tasks.len(), "cancellation requested, waiting for in-flight queries");
        }

        let mut summary = BatchSummary {
            run_id,
            total_queries: 0,
            records_added: 0,
            records_updated: 0,
            errors: 0,
            failed: 0,
            skipped: 0,
            interrupted,
            resumed,
            elapsed: Duration::ZERO,
        };
        while let Some(joined) = tasks.join_next().await {
            if matches!(joined, Ok(CheckpointOutcome::Skipped)) {
                summary.skipped += 1;
                continue;
            }
            summary.total_queries += 1;
            match joined {
                Ok(CheckpointOutcome::Completed(counts)) => {
                    summary.records_added += counts.new_found;
                    summary.records_updated += counts.updated_found;
                }
                Ok(CheckpointOutcome::Failed) => summary.failed += 1,
                Ok(CheckpointOutcome::Errored) => {
                    summary.errors += 1;
                    summary.failed += 1;
                }
                Ok(CheckpointOutcome::Skipped) => {}
                Err(e) => {
                    error!(run_id, error = %e, "checkpoint task panicked");
                    summary.errors += 1;
                }
            }
        }

        let progress = store.get_checkpoint_progress(run_id).await?;
        if summary.interrupted || !progress.is_finished() {
            store.interrupt_search_run(run_id).await?;
            summary.interrupted = true;
            info!(
                run_id,
                pending = progress.pending,
                in_progress = progress.in_progress,
                failed = progress.failed,
                "run interrupted, resumable"
            );
        } else {
            store
                .complete_run(
                    run_id,
                    &RunTotals {
                        queries_executed: progress.completed,
                        records_added: progress.new_found,
                        records_updated: progress.updated_found,
                    },
                )
                .await?;
            info!(
                run_id,
                queries = progress.completed,
                added = progress.new_found,
                updated = progress.updated_found,
                "run completed"
            );
        }

        summary.elapsed = started.elapsed();
        self.reporter.report(BatchProgressEvent::Finished {
            run_id,
            records_added: summary.records_added,
            records_updated: summary.records_updated,
            failed: summary.failed,
            interrupted: summary.interrupted,
        });
        Ok(summary)
    }
}

async fn process_checkpoint<S>(
    orchestrator: &Orchestrator<S>,
    run_id: i64,
    checkpoint: Checkpoint,
    plan: Option<QueryPlan>,
    max_results: usize,
) -> CheckpointOutcome
where
    S: CatalogStore + LedgerStore,
{
    let store = orchestrator.store();
    match store.claim_checkpoint(checkpoint.id).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(checkpoint_id = checkpoint.id, "checkpoint claimed elsewhere, skipping");
            return CheckpointOutcome::Skipped;
        }
        Err(e) => {
            error!(checkpoint_id = checkpoint.id, error = %e, "could not claim checkpoint");
            return CheckpointOutcome::Errored;
        }
    }

    let Some(plan) = plan else {
        warn!(
            checkpoint_id = checkpoint.id,
            query = %checkpoint.query_text,
            "no plan for checkpoint, completing with zero counts"
        );
        let counts = CheckpointCounts::default();
        return settle(
            checkpoint.id,
            store.complete_checkpoint(checkpoint.id, counts).await,
            CheckpointOutcome::Completed(counts),
        );
    };

    let request = SearchRequest::from_plan(&plan, max_results);
    match orchestrator.search_and_store(&request, Some(run_id)).await {
        Ok(summary) if summary.all_sources_failed() => {
            warn!(checkpoint_id = checkpoint.id, query = %plan.query, "every source failed");
            settle(
                checkpoint.id,
                store.fail_checkpoint(checkpoint.id).await,
                CheckpointOutcome::Failed,
            )
        }
        Ok(summary) => {
            let counts = CheckpointCounts::new(summary.new_count as i64, summary.updated_count as i64);
            settle(
                checkpoint.id,
                store.complete_checkpoint(checkpoint.id, counts).await,
                CheckpointOutcome::Completed(counts),
            )
        }
        Err(e) => {
            error!(checkpoint_id = checkpoint.id, query = %plan.query, error = %e, "query failed");
            settle(
                checkpoint.id,
                store.fail_checkpoint(checkpoint.id).await,
                CheckpointOutcome::Errored,
            )
        }
    }
}

/// Map the result of a checkpoint transition onto the batch outcome. A
/// transition refused by the ledger means the checkpoint was already
/// terminal, so this worker's result does not count.
fn settle(checkpoint_id: i64, transition: Result<bool>, outcome: CheckpointOutcome) -> CheckpointOutcome {
    match transition {
        Ok(true) => outcome,
        Ok(false) => {
            warn!(checkpoint_id, "checkpoint already settled by another worker");
            CheckpointOutcome::Skipped
        }
        Err(e) => {
            error!(checkpoint_id, error = %e, "could not update checkpoint");
            CheckpointOutcome::Errored
        }
    }
}

/// Cutoff year for an incremental refresh.
///
/// An explicit `YYYY` or `YYYY-MM-DD` wins. Otherwise the year the last
/// completed run started, otherwise last year.
pub async fn refresh_since_year<L>(store: &L, explicit: Option<&str>) -> Result<i32>
where
    L: LedgerStore + ?Sized,
{
    if let Some(raw) = explicit {
        let raw = raw.trim();
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            return Ok(date.year());
        }
        match raw.parse::<i32>() {
            Ok(year) if raw.len() == 4 => return Ok(year),
            _ => bail!("invalid --since value '{}': expected YYYY or YYYY-MM-DD", raw),
        }
    }

    if let Some(run) = store.get_last_completed_run().await? {
        if let Some(started) = Utc.timestamp_opt(run.started_at, 0).single() {
            return Ok(started.year());
        }
    }
    Ok(Utc::now().year() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CandidateRecord, SearchQuery, SearchResponse, RUN_TYPE_REFRESH};
    use crate::orchestrator::OrchestratorSettings;
    use crate::policy::{PolicySet, SourcePolicy};
    use crate::source::{Source, SourceError, SourceRegistry};
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    /// Echoes the query back as a single record; fails while `down` is set.
    struct Echo {
        down: Arc<AtomicBool>,
        calls: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Source for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn search(&self, query: &SearchQuery) -> Result<SearchResponse, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(SourceError::Transport("down".into()));
            }
            Ok(SearchResponse::new(vec![CandidateRecord::new(query.query.clone(), "echo")
                .with_identifier(format!("10.9/{}", query.query.replace(' ', "-")))]))
        }
    }

    fn driver(down: Arc<AtomicBool>) -> BatchDriver<InMemoryStore> {
        counting_driver(down, Arc::new(AtomicU64::new(0)))
    }

    fn counting_driver(down: Arc<AtomicBool>, calls: Arc<AtomicU64>) -> BatchDriver<InMemoryStore> {
        let policies = PolicySet::new().with(
            "echo",
            SourcePolicy {
                rate_qps: 10_000.0,
                failure_threshold: 1_000,
                ..Default::default()
            },
        );
        let orchestrator = Orchestrator::new(
            SourceRegistry::new().with(Echo { down, calls }),
            Arc::new(InMemoryStore::new()),
            OrchestratorSettings::default(),
        )
        .with_policies(policies);
        BatchDriver::new(Arc::new(orchestrator))
    }

    const TOPICS: &[&str] = &[
        "adhesive bonding",
        "biodiesel blends",
        "hydraulic lubricants",
        "printing inks",
        "polyurethane foam",
        "wood composites",
    ];

    fn plans(n: usize) -> Vec<QueryPlan> {
        TOPICS[..n]
            .iter()
            .map(|topic| QueryPlan::new(*topic, "application"))
            .collect()
    }

    #[tokio::test]
    async fn full_batch_completes_run() {
        let driver = driver(Arc::new(AtomicBool::new(false)));
        let summary = driver.run(plans(6), BatchOptions::default()).await.unwrap();
        assert_eq!(summary.total_queries, 6);
        assert_eq!(summary.records_added, 6);
        assert!(!summary.interrupted);

        let store = driver.orchestrator.store();
        let run = store.get_run(summary.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, crate::models::RunStatus::Completed);
        assert_eq!(run.records_added, 6);
        assert_eq!(run.queries_executed, 6);
    }

    #[tokio::test]
    async fn failed_queries_leave_run_resumable() {
        let down = Arc::new(AtomicBool::new(true));
        let driver = driver(down.clone());
        let first = driver.run(plans(4), BatchOptions::default()).await.unwrap();
        assert_eq!(first.failed, 4);
        assert!(first.interrupted);

        down.store(false, Ordering::SeqCst);
        let options = BatchOptions {
            resume: true,
            ..Default::default()
        };
        let second = driver.run(plans(4), options).await.unwrap();
        assert!(second.resumed);
        assert_eq!(second.run_id, first.run_id);
        assert_eq!(second.records_added, 4);
        assert!(!second.interrupted);

        let progress = driver
            .orchestrator
            .store()
            .get_checkpoint_progress(first.run_id)
            .await
            .unwrap();
        assert_eq!(progress.total, 4);
        assert_eq!(progress.completed, 4);
    }

    #[tokio::test]
    async fn max_queries_then_resume_finishes_the_rest() {
        let driver = driver(Arc::new(AtomicBool::new(false)));
        let first = driver
            .run(
                plans(5),
                BatchOptions {
                    max_queries: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(first.total_queries, 2);
        assert!(first.interrupted);

        let second = driver
            .run(
                plans(5),
                BatchOptions {
                    resume: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(second.total_queries, 3);
        assert_eq!(second.records_added, 3);
        let run = driver
            .orchestrator
            .store()
            .get_run(first.run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.records_added, 5);
    }

    #[tokio::test]
    async fn cancelled_before_start_interrupts_run() {
        let driver = driver(Arc::new(AtomicBool::new(false)));
        let options = BatchOptions::default();
        options.cancel.cancel();
        let summary = driver.run(plans(3), options).await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.total_queries, 0);

        let store = driver.orchestrator.store();
        let run = store
            .get_last_incomplete_run(RUN_TYPE_HISTORICAL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.id, summary.run_id);
        assert_eq!(run.status, crate::models::RunStatus::Interrupted);
        assert_eq!(store.get_pending_checkpoints(run.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn orphan_checkpoints_complete_with_zero_counts() {
        let driver = driver(Arc::new(AtomicBool::new(false)));
        driver
            .run(
                plans(3),
                BatchOptions {
                    max_queries: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // resume with a plan list that no longer mentions the third topic
        let summary = driver
            .run(
                plans(2),
                BatchOptions {
                    resume: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(summary.total_queries, 3);
        assert_eq!(summary.records_added, 2);
        assert!(!summary.interrupted);
    }

    #[tokio::test]
    async fn fresh_start_abandons_previous_incomplete_run() {
        let driver = driver(Arc::new(AtomicBool::new(true)));
        let first = driver.run(plans(1), BatchOptions::default()).await.unwrap();
        let second = driver.run(plans(1), BatchOptions::default()).await.unwrap();
        assert_ne!(first.run_id, second.run_id);

        let store = driver.orchestrator.store();
        let old = store.get_run(first.run_id).await.unwrap().unwrap();
        assert_eq!(old.status, crate::models::RunStatus::Failed);
    }

    #[tokio::test]
    async fn concurrent_resumes_run_each_checkpoint_once() {
        let calls = Arc::new(AtomicU64::new(0));
        let first = counting_driver(Arc::new(AtomicBool::new(false)), calls.clone());
        let second = BatchDriver::new(first.orchestrator.clone());
        let seeded = first
            .run(
                plans(4),
                BatchOptions {
                    max_queries: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let resume = || BatchOptions {
            resume: true,
            ..Default::default()
        };
        let (a, b) = tokio::join!(first.run(plans(4), resume()), second.run(plans(4), resume()));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.run_id, seeded.run_id);
        assert_eq!(b.run_id, seeded.run_id);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(a.total_queries + b.total_queries, 4);
        assert_eq!(a.records_added + b.records_added, 4);

        let store = first.orchestrator.store();
        let run = store.get_run(seeded.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, crate::models::RunStatus::Completed);
        assert_eq!(run.queries_executed, 4);
        assert_eq!(run.records_added, 4);
    }

    #[tokio::test]
    async fn resume_releases_stale_claims() {
        let calls = Arc::new(AtomicU64::new(0));
        let driver = counting_driver(Arc::new(AtomicBool::new(false)), calls.clone());
        let seeded = driver
            .run(
                plans(2),
                BatchOptions {
                    max_queries: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // a worker that died after claiming
        let store = driver.orchestrator.store();
        let orphan = store.get_pending_checkpoints(seeded.run_id).await.unwrap().remove(0);
        assert!(store.claim_checkpoint(orphan.id).await.unwrap());

        let kept = driver
            .run(
                plans(2),
                BatchOptions {
                    resume: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(kept.total_queries, 1);
        assert!(kept.interrupted);

        let released = driver
            .run(
                plans(2),
                BatchOptions {
                    resume: true,
                    claim_lease: Duration::ZERO,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(released.total_queries, 1);
        assert!(!released.interrupted);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn batch_sees_records_stored_outside_the_orchestrator() {
        let driver = driver(Arc::new(AtomicBool::new(false)));
        driver
            .orchestrator
            .search(&SearchRequest::new("warm up"))
            .await
            .unwrap();

        // written by another process after the index was loaded
        let store = driver.orchestrator.store();
        store
            .insert_record(&CandidateRecord::new("Adhesive bonding", "manual"))
            .await
            .unwrap();

        let summary = driver.run(plans(1), BatchOptions::default()).await.unwrap();
        assert_eq!(summary.records_added, 0);
        assert_eq!(summary.records_updated, 1);
        assert_eq!(store.record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn refresh_year_resolution() {
        let store = InMemoryStore::new();
        assert_eq!(refresh_since_year(&store, Some("2019")).await.unwrap(), 2019);
        assert_eq!(refresh_since_year(&store, Some("2021-06-30")).await.unwrap(), 2021);
        assert!(refresh_since_year(&store, Some("last week")).await.is_err());
        assert_eq!(
            refresh_since_year(&store, None).await.unwrap(),
            Utc::now().year() - 1
        );

        let run = store.start_run(RUN_TYPE_REFRESH).await.unwrap();
        store.complete_run(run, &RunTotals::default()).await.unwrap();
        assert_eq!(refresh_since_year(&store, None).await.unwrap(), Utc::now().year());
    }
}
