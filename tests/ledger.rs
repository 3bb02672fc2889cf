use std::time::Duration;

use catalog_harvest::{db, migrate, sqlite_store::SqliteStore};
use harvest_core::models::{
    CandidateRecord, CheckpointCounts, CheckpointSpec, QueryLogEntry, RunStatus, RunTotals,
    RUN_TYPE_HISTORICAL, RUN_TYPE_REFRESH,
};
use harvest_core::store::{CatalogStore, InsertOutcome, LedgerStore};
use tempfile::TempDir;

async fn open_store() -> (TempDir, SqliteStore) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect(&tmp.path().join("data/harvest.sqlite")).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    (tmp, SqliteStore::new(pool))
}

fn specs(n: usize) -> Vec<CheckpointSpec> {
    (0..n)
        .map(|i| CheckpointSpec::for_query(format!("soy protein query {}", i)))
        .collect()
}

#[tokio::test]
async fn seeding_is_idempotent() {
    let (_tmp, store) = open_store().await;
    let run_id = store.start_run(RUN_TYPE_HISTORICAL).await.unwrap();

    assert_eq!(store.insert_checkpoint_batch(run_id, &specs(5)).await.unwrap(), 5);
    assert_eq!(store.insert_checkpoint_batch(run_id, &specs(5)).await.unwrap(), 0);

    let pending = store.get_pending_checkpoints(run_id).await.unwrap();
    assert_eq!(pending.len(), 5);

    let progress = store.get_checkpoint_progress(run_id).await.unwrap();
    assert_eq!(progress.total, 5);
    assert_eq!(progress.pending, 5);
}

#[tokio::test]
async fn same_query_may_be_seeded_in_different_runs() {
    let (_tmp, store) = open_store().await;
    let first = store.start_run(RUN_TYPE_HISTORICAL).await.unwrap();
    let second = store.start_run(RUN_TYPE_REFRESH).await.unwrap();

    assert_eq!(store.insert_checkpoint_batch(first, &specs(2)).await.unwrap(), 2);
    assert_eq!(store.insert_checkpoint_batch(second, &specs(2)).await.unwrap(), 2);
}

#[tokio::test]
async fn interrupted_run_resumes_with_failed_checkpoints_retried() {
    let (_tmp, store) = open_store().await;
    let run_id = store.start_run(RUN_TYPE_HISTORICAL).await.unwrap();
    store.insert_checkpoint_batch(run_id, &specs(8)).await.unwrap();

    let pending = store.get_pending_checkpoints(run_id).await.unwrap();
    for (i, cp) in pending.iter().take(3).enumerate() {
        let counts = CheckpointCounts::new(i as i64 + 1, 1);
        assert!(store.complete_checkpoint(cp.id, counts).await.unwrap());
    }
    assert!(store.fail_checkpoint(pending[3].id).await.unwrap());
    store.interrupt_search_run(run_id).await.unwrap();

    let incomplete = store
        .get_last_incomplete_run(RUN_TYPE_HISTORICAL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(incomplete.id, run_id);
    assert_eq!(incomplete.status, RunStatus::Interrupted);
    assert!(store.get_last_incomplete_run(RUN_TYPE_REFRESH).await.unwrap().is_none());

    assert_eq!(store.reset_failed_checkpoints(run_id).await.unwrap(), 1);
    let remaining = store.get_pending_checkpoints(run_id).await.unwrap();
    assert_eq!(remaining.len(), 5);

    for cp in &remaining {
        assert!(store
            .complete_checkpoint(cp.id, CheckpointCounts::new(2, 0))
            .await
            .unwrap());
    }

    let progress = store.get_checkpoint_progress(run_id).await.unwrap();
    assert_eq!(progress.total, 8);
    assert_eq!(progress.completed, 8);
    assert_eq!(progress.failed, 0);
    assert_eq!(progress.pending, 0);
    assert_eq!(progress.new_found, 1 + 2 + 3 + 5 * 2);
    assert_eq!(progress.updated_found, 3);
    assert!(progress.is_finished());
}

#[tokio::test]
async fn terminal_checkpoints_are_not_rewritten() {
    let (_tmp, store) = open_store().await;
    let run_id = store.start_run(RUN_TYPE_HISTORICAL).await.unwrap();
    store.insert_checkpoint_batch(run_id, &specs(1)).await.unwrap();
    let cp = store.get_pending_checkpoints(run_id).await.unwrap().remove(0);

    assert!(store.complete_checkpoint(cp.id, CheckpointCounts::new(4, 0)).await.unwrap());
    assert!(!store.complete_checkpoint(cp.id, CheckpointCounts::new(9, 9)).await.unwrap());
    assert!(!store.fail_checkpoint(cp.id).await.unwrap());

    let progress = store.get_checkpoint_progress(run_id).await.unwrap();
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.new_found, 4);
}

#[tokio::test]
async fn claims_are_exclusive_and_released_when_stale() {
    let (_tmp, store) = open_store().await;
    let run_id = store.start_run(RUN_TYPE_HISTORICAL).await.unwrap();
    store.insert_checkpoint_batch(run_id, &specs(3)).await.unwrap();
    let pending = store.get_pending_checkpoints(run_id).await.unwrap();

    assert!(store.claim_checkpoint(pending[0].id).await.unwrap());
    assert!(!store.claim_checkpoint(pending[0].id).await.unwrap());
    assert!(store.claim_checkpoint(pending[1].id).await.unwrap());
    assert!(store
        .complete_checkpoint(pending[1].id, CheckpointCounts::new(1, 0))
        .await
        .unwrap());
    assert!(!store.claim_checkpoint(pending[1].id).await.unwrap());

    let open = store.get_pending_checkpoints(run_id).await.unwrap();
    assert_eq!(open.iter().map(|c| c.id).collect::<Vec<_>>(), vec![pending[2].id]);
    let progress = store.get_checkpoint_progress(run_id).await.unwrap();
    assert_eq!(progress.in_progress, 1);
    assert_eq!(progress.completed, 1);
    assert!(!progress.is_finished());

    let lease = Duration::from_secs(3600);
    assert_eq!(store.release_stale_claims(run_id, lease).await.unwrap(), 0);
    assert_eq!(store.release_stale_claims(run_id, Duration::ZERO).await.unwrap(), 1);
    let released = store.get_pending_checkpoints(run_id).await.unwrap();
    assert_eq!(released.len(), 2);
    assert!(released.iter().all(|c| c.claimed_at.is_none()));
}

#[tokio::test]
async fn interrupt_does_not_reopen_completed_run() {
    let (_tmp, store) = open_store().await;
    let run_id = store.start_run(RUN_TYPE_HISTORICAL).await.unwrap();
    store.complete_run(run_id, &RunTotals::default()).await.unwrap();
    store.interrupt_search_run(run_id).await.unwrap();
    assert_eq!(
        store.get_run(run_id).await.unwrap().unwrap().status,
        RunStatus::Completed
    );
}

#[tokio::test]
async fn run_lifecycle_and_listing() {
    let (_tmp, store) = open_store().await;
    let first = store.start_run(RUN_TYPE_HISTORICAL).await.unwrap();
    store
        .complete_run(
            first,
            &RunTotals {
                queries_executed: 10,
                records_added: 7,
                records_updated: 3,
            },
        )
        .await
        .unwrap();
    let second = store.start_run(RUN_TYPE_REFRESH).await.unwrap();
    store.fail_run(second).await.unwrap();

    let done = store.get_run(first).await.unwrap().unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.records_added, 7);
    assert!(done.completed_at.is_some());

    let last = store.get_last_completed_run().await.unwrap().unwrap();
    assert_eq!(last.id, first);

    let runs = store.list_runs(10).await.unwrap();
    assert_eq!(runs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second, first]);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(store.list_runs(1).await.unwrap().len(), 1);
    assert!(store.get_run(9_999).await.unwrap().is_none());
}

#[tokio::test]
async fn identifier_constraint_reports_duplicate() {
    let (_tmp, store) = open_store().await;
    let first = CandidateRecord::new("Soy adhesives", "openalex").with_identifier("10.1234/test");
    let again = CandidateRecord::new("Soy adhesives (preprint)", "crossref")
        .with_identifier("https://doi.org/10.1234/TEST");

    let id = match store.insert_record(&first).await.unwrap() {
        InsertOutcome::Inserted(id) => id,
        other => panic!("expected insert, got {:?}", other),
    };
    assert_eq!(
        store.insert_record(&again).await.unwrap(),
        InsertOutcome::Duplicate(Some(id))
    );
    assert_eq!(store.record_count().await.unwrap(), 1);

    store.add_record_source(id, "openalex").await.unwrap();
    store.add_record_source(id, "crossref").await.unwrap();
    store.add_record_source(id, "openalex").await.unwrap();

    let stored = store.find_by_identifier("10.1234/TEST").await.unwrap().unwrap();
    assert_eq!(stored.id, id);
    assert_eq!(stored.sources, vec!["crossref".to_string(), "openalex".to_string()]);

    let snapshot = store.catalog_snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].title, "Soy adhesives");
}

#[tokio::test]
async fn records_without_identifier_insert_freely() {
    let (_tmp, store) = open_store().await;
    let a = CandidateRecord::new("Lignin binders", "core").with_year(2015);
    let b = CandidateRecord::new("Lignin binders", "core").with_year(2015);
    assert!(matches!(store.insert_record(&a).await.unwrap(), InsertOutcome::Inserted(_)));
    assert!(matches!(store.insert_record(&b).await.unwrap(), InsertOutcome::Inserted(_)));
    assert_eq!(store.record_count().await.unwrap(), 2);
}

#[tokio::test]
async fn query_log_accepts_entries() {
    let (_tmp, store) = open_store().await;
    let run_id = store.start_run(RUN_TYPE_HISTORICAL).await.unwrap();
    store
        .log_query(&QueryLogEntry {
            run_id,
            query_text: "soy foam".into(),
            sources: vec!["openalex".into(), "crossref".into()],
            results_returned: 12,
            new_records: 4,
        })
        .await
        .unwrap();

    let logged: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM search_queries WHERE run_id = ?")
        .bind(run_id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(logged, 1);
}
