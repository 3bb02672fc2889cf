//! In-memory [`CatalogStore`] and [`LedgerStore`] for tests and dry runs.
//!
//! Uses `HashMap`s and `Vec`s behind `std::sync::RwLock`. Ids are assigned
//! from a counter starting at 1, like an autoincrement column.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{
    CandidateRecord, CatalogEntry, Checkpoint, CheckpointCounts, CheckpointProgress,
    CheckpointSpec, CheckpointStatus, QueryLogEntry, Run, RunStatus, RunTotals, StoredRecord,
};

use super::{CatalogStore, InsertOutcome, LedgerStore};

struct MemRecord {
    record: CandidateRecord,
    sources: BTreeSet<String>,
    created_at: i64,
}

#[derive(Default)]
struct CatalogState {
    records: Vec<(i64, MemRecord)>,
    by_identifier: HashMap<String, i64>,
    queries: Vec<QueryLogEntry>,
}

impl CatalogState {
    fn stored(&self, id: i64) -> Option<StoredRecord> {
        self.records
            .iter()
            .find(|(rid, _)| *rid == id)
            .map(|(rid, m)| to_stored(*rid, m))
    }
}

#[derive(Default)]
struct LedgerState {
    runs: Vec<Run>,
    checkpoints: Vec<Checkpoint>,
    next_checkpoint_id: i64,
}

/// In-memory store.
pub struct InMemoryStore {
    catalog: RwLock<CatalogState>,
    ledger: RwLock<LedgerState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            catalog: RwLock::new(CatalogState::default()),
            ledger: RwLock::new(LedgerState::default()),
        }
    }

    /// Audit rows logged so far.
    pub fn logged_queries(&self) -> Result<Vec<QueryLogEntry>> {
        Ok(self.read_catalog()?.queries.clone())
    }

    fn read_catalog(&self) -> Result<RwLockReadGuard<'_, CatalogState>> {
        self.catalog.read().map_err(|_| anyhow!("catalog lock poisoned"))
    }

    fn write_catalog(&self) -> Result<RwLockWriteGuard<'_, CatalogState>> {
        self.catalog.write().map_err(|_| anyhow!("catalog lock poisoned"))
    }

    fn read_ledger(&self) -> Result<RwLockReadGuard<'_, LedgerState>> {
        self.ledger.read().map_err(|_| anyhow!("ledger lock poisoned"))
    }

    fn write_ledger(&self) -> Result<RwLockWriteGuard<'_, LedgerState>> {
        self.ledger.write().map_err(|_| anyhow!("ledger lock poisoned"))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn to_stored(id: i64, m: &MemRecord) -> StoredRecord {
    let r = &m.record;
    StoredRecord {
        id,
        title: r.title.clone(),
        identifier: r.identifier.clone(),
        year: r.year,
        abstract_text: r.abstract_text.clone(),
        venue: r.venue.clone(),
        url: r.url.clone(),
        pdf_url: r.pdf_url.clone(),
        authors: r.authors.clone(),
        citation_count: r.citation_count,
        sources: m.sources.iter().cloned().collect(),
        created_at: m.created_at,
    }
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn catalog_snapshot(&self) -> Result<Vec<CatalogEntry>> {
        let state = self.read_catalog()?;
        Ok(state
            .records
            .iter()
            .map(|(id, m)| CatalogEntry {
                id: *id,
                identifier: m.record.identifier.clone(),
                title: m.record.title.clone(),
            })
            .collect())
    }

    async fn insert_record(&self, record: &CandidateRecord) -> Result<InsertOutcome> {
        let mut state = self.write_catalog()?;
        let norm = record.normalized_identifier();
        if let Some(existing) = norm.as_ref().and_then(|n| state.by_identifier.get(n)) {
            return Ok(InsertOutcome::Duplicate(Some(*existing)));
        }
        let id = state.records.len() as i64 + 1;
        if let Some(n) = norm {
            state.by_identifier.insert(n, id);
        }
        state.records.push((
            id,
            MemRecord {
                record: record.clone(),
                sources: BTreeSet::from([record.source.clone()]),
                created_at: now(),
            },
        ));
        Ok(InsertOutcome::Inserted(id))
    }

    async fn add_record_source(&self, record_id: i64, source: &str) -> Result<()> {
        let mut state = self.write_catalog()?;
        let (_, m) = state
            .records
            .iter_mut()
            .find(|(id, _)| *id == record_id)
            .ok_or_else(|| anyhow!("no record with id {}", record_id))?;
        m.sources.insert(source.to_string());
        Ok(())
    }

    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<StoredRecord>> {
        let Some(norm) = crate::dedup::normalize_identifier(identifier) else {
            return Ok(None);
        };
        let state = self.read_catalog()?;
        Ok(state.by_identifier.get(&norm).and_then(|id| state.stored(*id)))
    }

    async fn get_record(&self, id: i64) -> Result<Option<StoredRecord>> {
        Ok(self.read_catalog()?.stored(id))
    }

    async fn record_count(&self) -> Result<i64> {
        Ok(self.read_catalog()?.records.len() as i64)
    }

    async fn log_query(&self, entry: &QueryLogEntry) -> Result<()> {
        self.write_catalog()?.queries.push(entry.clone());
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn start_run(&self, run_type: &str) -> Result<i64> {
        let mut state = self.write_ledger()?;
        let id = state.runs.len() as i64 + 1;
        state.runs.push(Run {
            id,
            run_type: run_type.to_string(),
            status: RunStatus::Running,
            started_at: now(),
            completed_at: None,
            queries_executed: 0,
            records_added: 0,
            records_updated: 0,
        });
        Ok(id)
    }

    async fn complete_run(&self, run_id: i64, totals: &RunTotals) -> Result<()> {
        let mut state = self.write_ledger()?;
        if let Some(run) = state.runs.iter_mut().find(|r| r.id == run_id) {
            run.status = RunStatus::Completed;
            run.completed_at = Some(now());
            run.queries_executed = totals.queries_executed;
            run.records_added = totals.records_added;
            run.records_updated = totals.records_updated;
        }
        Ok(())
    }

    async fn fail_run(&self, run_id: i64) -> Result<()> {
        let mut state = self.write_ledger()?;
        if let Some(run) = state.runs.iter_mut().find(|r| r.id == run_id) {
            run.status = RunStatus::Failed;
            run.completed_at = Some(now());
        }
        Ok(())
    }

    async fn interrupt_search_run(&self, run_id: i64) -> Result<()> {
        let mut state = self.write_ledger()?;
        if let Some(run) = state
            .runs
            .iter_mut()
            .find(|r| r.id == run_id && r.status != RunStatus::Completed)
        {
            run.status = RunStatus::Interrupted;
            run.completed_at = Some(now());
        }
        Ok(())
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<Run>> {
        Ok(self.read_ledger()?.runs.iter().find(|r| r.id == run_id).cloned())
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        Ok(self.read_ledger()?.runs.iter().rev().take(limit).cloned().collect())
    }

    async fn get_last_incomplete_run(&self, run_type: &str) -> Result<Option<Run>> {
        Ok(self
            .read_ledger()?
            .runs
            .iter()
            .rev()
            .find(|r| r.run_type == run_type && r.status.is_incomplete())
            .cloned())
    }

    async fn get_last_completed_run(&self) -> Result<Option<Run>> {
        Ok(self
            .read_ledger()?
            .runs
            .iter()
            .rev()
            .find(|r| r.status == RunStatus::Completed)
            .cloned())
    }

    async fn insert_checkpoint_batch(&self, run_id: i64, specs: &[CheckpointSpec]) -> Result<u64> {
        let mut state = self.write_ledger()?;
        let mut inserted = 0;
        for spec in specs {
            let exists = state
                .checkpoints
                .iter()
                .any(|c| c.run_id == run_id && c.query_hash == spec.query_hash);
            if exists {
                continue;
            }
            state.next_checkpoint_id += 1;
            let id = state.next_checkpoint_id;
            state.checkpoints.push(Checkpoint {
                id,
                run_id,
                query_hash: spec.query_hash.clone(),
                query_text: spec.query_text.clone(),
                query_type: spec.query_type.clone(),
                category: spec.category.clone(),
                subcategory: spec.subcategory.clone(),
                year_start: spec.year_start,
                year_end: spec.year_end,
                status: CheckpointStatus::Pending,
                new_found: 0,
                updated_found: 0,
                claimed_at: None,
                completed_at: None,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn get_pending_checkpoints(&self, run_id: i64) -> Result<Vec<Checkpoint>> {
        Ok(self
            .read_ledger()?
            .checkpoints
            .iter()
            .filter(|c| c.run_id == run_id && c.status == CheckpointStatus::Pending)
            .cloned()
            .collect())
    }

    async fn claim_checkpoint(&self, checkpoint_id: i64) -> Result<bool> {
        let mut state = self.write_ledger()?;
        match state
            .checkpoints
            .iter_mut()
            .find(|c| c.id == checkpoint_id && c.status == CheckpointStatus::Pending)
        {
            Some(c) => {
                c.status = CheckpointStatus::InProgress;
                c.claimed_at = Some(now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release_stale_claims(&self, run_id: i64, older_than: Duration) -> Result<u64> {
        let cutoff = now() - older_than.as_secs() as i64;
        let mut state = self.write_ledger()?;
        let mut released = 0;
        for c in state.checkpoints.iter_mut().filter(|c| {
            c.run_id == run_id
                && c.status == CheckpointStatus::InProgress
                && c.claimed_at.map_or(true, |at| at <= cutoff)
        }) {
            c.status = CheckpointStatus::Pending;
            c.claimed_at = None;
            released += 1;
        }
        Ok(released)
    }

    async fn complete_checkpoint(&self, checkpoint_id: i64, counts: CheckpointCounts) -> Result<bool> {
        let mut state = self.write_ledger()?;
        match state
            .checkpoints
            .iter_mut()
            .find(|c| c.id == checkpoint_id && c.status.is_open())
        {
            Some(c) => {
                c.status = CheckpointStatus::Completed;
                c.new_found = counts.new_found;
                c.updated_found = counts.updated_found;
                c.completed_at = Some(now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn fail_checkpoint(&self, checkpoint_id: i64) -> Result<bool> {
        let mut state = self.write_ledger()?;
        match state
            .checkpoints
            .iter_mut()
            .find(|c| c.id == checkpoint_id && c.status.is_open())
        {
            Some(c) => {
                c.status = CheckpointStatus::Failed;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reset_failed_checkpoints(&self, run_id: i64) -> Result<u64> {
        let mut state = self.write_ledger()?;
        let mut reset = 0;
        for c in state
            .checkpoints
            .iter_mut()
            .filter(|c| c.run_id == run_id && c.status == CheckpointStatus::Failed)
        {
            c.status = CheckpointStatus::Pending;
            reset += 1;
        }
        Ok(reset)
    }

    async fn get_checkpoint_progress(&self, run_id: i64) -> Result<CheckpointProgress> {
        let state = self.read_ledger()?;
        let mut progress = CheckpointProgress::default();
        for c in state.checkpoints.iter().filter(|c| c.run_id == run_id) {
            progress.total += 1;
            match c.status {
                CheckpointStatus::Pending => progress.pending += 1,
                CheckpointStatus::InProgress => progress.in_progress += 1,
                CheckpointStatus::Failed => progress.failed += 1,
                CheckpointStatus::Completed => {
                    progress.completed += 1;
                    progress.new_found += c.new_found;
                    progress.updated_found += c.updated_found;
                }
            }
        }
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(n: usize) -> Vec<CheckpointSpec> {
        (0..n)
            .map(|i| CheckpointSpec::for_query(format!("soy query {}", i)))
            .collect()
    }

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let store = InMemoryStore::new();
        let run = store.start_run("historical_build").await.unwrap();
        assert_eq!(store.insert_checkpoint_batch(run, &specs(5)).await.unwrap(), 5);
        assert_eq!(store.insert_checkpoint_batch(run, &specs(5)).await.unwrap(), 0);
        assert_eq!(store.get_pending_checkpoints(run).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn same_hash_in_different_runs_is_allowed() {
        let store = InMemoryStore::new();
        let a = store.start_run("historical_build").await.unwrap();
        let b = store.start_run("historical_build").await.unwrap();
        assert_eq!(store.insert_checkpoint_batch(a, &specs(2)).await.unwrap(), 2);
        assert_eq!(store.insert_checkpoint_batch(b, &specs(2)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn checkpoint_transitions_are_claims() {
        let store = InMemoryStore::new();
        let run = store.start_run("historical_build").await.unwrap();
        store.insert_checkpoint_batch(run, &specs(2)).await.unwrap();
        let pending = store.get_pending_checkpoints(run).await.unwrap();

        assert!(store
            .complete_checkpoint(pending[0].id, CheckpointCounts::new(3, 1))
            .await
            .unwrap());
        assert!(!store
            .complete_checkpoint(pending[0].id, CheckpointCounts::new(9, 9))
            .await
            .unwrap());
        assert!(!store.fail_checkpoint(pending[0].id).await.unwrap());

        assert!(store.fail_checkpoint(pending[1].id).await.unwrap());
        let progress = store.get_checkpoint_progress(run).await.unwrap();
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.new_found, 3);
        assert_eq!(progress.updated_found, 1);
    }

    #[tokio::test]
    async fn claimed_checkpoint_runs_once() {
        let store = InMemoryStore::new();
        let run = store.start_run("historical_build").await.unwrap();
        store.insert_checkpoint_batch(run, &specs(3)).await.unwrap();
        let pending = store.get_pending_checkpoints(run).await.unwrap();

        assert!(store.claim_checkpoint(pending[0].id).await.unwrap());
        assert!(!store.claim_checkpoint(pending[0].id).await.unwrap());
        assert_eq!(store.get_pending_checkpoints(run).await.unwrap().len(), 2);

        let progress = store.get_checkpoint_progress(run).await.unwrap();
        assert_eq!(progress.in_progress, 1);
        assert_eq!(progress.pending, 2);
        assert!(!progress.is_finished());

        assert!(store
            .complete_checkpoint(pending[0].id, CheckpointCounts::new(2, 0))
            .await
            .unwrap());
        assert!(!store.claim_checkpoint(pending[0].id).await.unwrap());
        assert_eq!(store.get_checkpoint_progress(run).await.unwrap().in_progress, 0);
    }

    #[tokio::test]
    async fn stale_claims_return_to_pending() {
        let store = InMemoryStore::new();
        let run = store.start_run("historical_build").await.unwrap();
        store.insert_checkpoint_batch(run, &specs(2)).await.unwrap();
        let pending = store.get_pending_checkpoints(run).await.unwrap();
        assert!(store.claim_checkpoint(pending[0].id).await.unwrap());
        assert!(store.claim_checkpoint(pending[1].id).await.unwrap());
        assert!(store.fail_checkpoint(pending[1].id).await.unwrap());

        let lease = Duration::from_secs(3600);
        assert_eq!(store.release_stale_claims(run, lease).await.unwrap(), 0);
        assert_eq!(store.release_stale_claims(run, Duration::ZERO).await.unwrap(), 1);

        let pending = store.get_pending_checkpoints(run).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].claimed_at, None);
        assert_eq!(store.get_checkpoint_progress(run).await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn interrupt_leaves_completed_run_alone() {
        let store = InMemoryStore::new();
        let run = store.start_run("historical_build").await.unwrap();
        store.complete_run(run, &RunTotals::default()).await.unwrap();
        store.interrupt_search_run(run).await.unwrap();
        let run = store.get_run(run).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn last_incomplete_run_ignores_terminal_and_other_types() {
        let store = InMemoryStore::new();
        let old = store.start_run("historical_build").await.unwrap();
        store.interrupt_search_run(old).await.unwrap();
        let done = store.start_run("historical_build").await.unwrap();
        store.complete_run(done, &RunTotals::default()).await.unwrap();
        store.start_run("incremental_refresh").await.unwrap();

        let found = store
            .get_last_incomplete_run("historical_build")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, old);
        assert_eq!(found.status, RunStatus::Interrupted);
        assert!(found.completed_at.is_some());

        assert_eq!(store.get_last_completed_run().await.unwrap().unwrap().id, done);
        assert_eq!(store.list_runs(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn identifier_collision_is_a_duplicate() {
        let store = InMemoryStore::new();
        let first = CandidateRecord::new("Soy ink", "crossref").with_identifier("10.1/ink");
        let second = CandidateRecord::new("Soy ink (reprint)", "openalex")
            .with_identifier("https://doi.org/10.1/INK");

        let id = match store.insert_record(&first).await.unwrap() {
            InsertOutcome::Inserted(id) => id,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            store.insert_record(&second).await.unwrap(),
            InsertOutcome::Duplicate(Some(id))
        );
        store.add_record_source(id, "openalex").await.unwrap();
        store.add_record_source(id, "openalex").await.unwrap();

        let stored = store.find_by_identifier("doi:10.1/ink").await.unwrap().unwrap();
        assert_eq!(stored.sources, vec!["crossref", "openalex"]);
        assert_eq!(store.record_count().await.unwrap(), 1);
    }
}
