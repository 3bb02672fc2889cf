//! Storage abstraction for the catalog and the run/checkpoint ledger.
//!
//! [`CatalogStore`] holds deduplicated records; [`LedgerStore`] tracks batch
//! runs and their checkpoints so a long batch can be resumed. Backends must
//! be `Send + Sync` and serialize their own writers.

pub mod memory;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    CandidateRecord, CatalogEntry, Checkpoint, CheckpointCounts, CheckpointProgress,
    CheckpointSpec, QueryLogEntry, Run, RunTotals, StoredRecord,
};

/// What happened to an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// The normalized identifier was already taken. Carries the owner's id
    /// when the backend can resolve it.
    Duplicate(Option<i64>),
}

/// The deduplicated record catalog.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`catalog_snapshot`](CatalogStore::catalog_snapshot) | ids, identifiers and titles for seeding dedup |
/// | [`insert_record`](CatalogStore::insert_record) | atomic insert, duplicate-aware |
/// | [`add_record_source`](CatalogStore::add_record_source) | attribute a record to a source |
/// | [`log_query`](CatalogStore::log_query) | append a query audit row |
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn catalog_snapshot(&self) -> Result<Vec<CatalogEntry>>;

    /// Insert a record and attribute it to `record.source`. A collision on
    /// the normalized identifier is reported as [`InsertOutcome::Duplicate`],
    /// never as an error.
    async fn insert_record(&self, record: &CandidateRecord) -> Result<InsertOutcome>;

    /// Idempotent.
    async fn add_record_source(&self, record_id: i64, source: &str) -> Result<()>;

    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<StoredRecord>>;

    async fn get_record(&self, id: i64) -> Result<Option<StoredRecord>>;

    async fn record_count(&self) -> Result<i64>;

    async fn log_query(&self, entry: &QueryLogEntry) -> Result<()>;
}

/// Runs and checkpoints.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create a `running` run and return its id.
    async fn start_run(&self, run_type: &str) -> Result<i64>;

    async fn complete_run(&self, run_id: i64, totals: &RunTotals) -> Result<()>;

    async fn fail_run(&self, run_id: i64) -> Result<()>;

    /// Mark a run `interrupted` and stamp its completion time. A run that
    /// already reached `completed` is left alone.
    async fn interrupt_search_run(&self, run_id: i64) -> Result<()>;

    async fn get_run(&self, run_id: i64) -> Result<Option<Run>>;

    /// Newest first.
    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>>;

    /// Most recently created run of `run_type` that is `running` or
    /// `interrupted`.
    async fn get_last_incomplete_run(&self, run_type: &str) -> Result<Option<Run>>;

    /// Most recently created `completed` run of any type.
    async fn get_last_completed_run(&self) -> Result<Option<Run>>;

    /// Seed checkpoints, skipping hashes already present in the run.
    /// Returns the number actually inserted.
    async fn insert_checkpoint_batch(&self, run_id: i64, specs: &[CheckpointSpec]) -> Result<u64>;

    /// Checkpoints still `pending`, in insertion order. Claimed checkpoints
    /// are not included.
    async fn get_pending_checkpoints(&self, run_id: i64) -> Result<Vec<Checkpoint>>;

    /// `pending → in_progress`, stamping the claim time. Returns `false` if
    /// the checkpoint was not pending, so only one worker executes it.
    async fn claim_checkpoint(&self, checkpoint_id: i64) -> Result<bool>;

    /// `in_progress → pending` for claims at least `older_than` old. Returns
    /// how many were released.
    async fn release_stale_claims(&self, run_id: i64, older_than: Duration) -> Result<u64>;

    /// `pending | in_progress → completed`. Returns `false` if the checkpoint
    /// had already reached a terminal status.
    async fn complete_checkpoint(&self, checkpoint_id: i64, counts: CheckpointCounts) -> Result<bool>;

    /// `pending | in_progress → failed`. Returns `false` if the checkpoint
    /// had already reached a terminal status.
    async fn fail_checkpoint(&self, checkpoint_id: i64) -> Result<bool>;

    /// `failed → pending` for the whole run. Returns how many were reset.
    async fn reset_failed_checkpoints(&self, run_id: i64) -> Result<u64>;

    async fn get_checkpoint_progress(&self, run_id: i64) -> Result<CheckpointProgress>;
}
