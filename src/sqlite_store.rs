//! SQLite-backed [`CatalogStore`] and [`LedgerStore`].
//!
//! Reads go straight to the pool. Writes take a process-wide write lock so
//! there is a single writer, and each record insert runs in its own
//! transaction so a crash never leaves a half-written record.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use harvest_core::models::{
    CandidateRecord, CatalogEntry, Checkpoint, CheckpointCounts, CheckpointProgress,
    CheckpointSpec, QueryLogEntry, Run, RunTotals, StoredRecord,
};
use harvest_core::store::{CatalogStore, InsertOutcome, LedgerStore};

/// SQLite implementation of the catalog and ledger traits.
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn sources_for(&self, record_id: i64) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT source FROM record_sources WHERE record_id = ? ORDER BY source")
            .bind(record_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("source")).collect())
    }

    async fn stored_from_row(&self, row: &SqliteRow) -> Result<StoredRecord> {
        let id: i64 = row.get("id");
        let authors_json: String = row.get("authors_json");
        let authors: Vec<String> = serde_json::from_str(&authors_json)
            .with_context(|| format!("bad authors_json on record {}", id))?;
        Ok(StoredRecord {
            id,
            title: row.get("title"),
            identifier: row.get("identifier"),
            year: row.get("year"),
            abstract_text: row.get("abstract"),
            venue: row.get("venue"),
            url: row.get("url"),
            pdf_url: row.get("pdf_url"),
            authors,
            citation_count: row.get("citation_count"),
            sources: self.sources_for(id).await?,
            created_at: row.get("created_at"),
        })
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

const RECORD_COLUMNS: &str = "id, title, identifier, year, abstract, venue, url, pdf_url, \
                              authors_json, citation_count, created_at";

const RUN_COLUMNS: &str = "id, run_type, status, started_at, completed_at, queries_executed, \
                           records_added, records_updated";

const CHECKPOINT_COLUMNS: &str = "id, run_id, query_hash, query_text, query_type, category, \
                                  subcategory, year_start, year_end, status, new_found, \
                                  updated_found, claimed_at, completed_at";

fn run_from_row(row: &SqliteRow) -> Result<Run> {
    let status: String = row.get("status");
    Ok(Run {
        id: row.get("id"),
        run_type: row.get("run_type"),
        status: status.parse()?,
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        queries_executed: row.get("queries_executed"),
        records_added: row.get("records_added"),
        records_updated: row.get("records_updated"),
    })
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<Checkpoint> {
    let status: String = row.get("status");
    Ok(Checkpoint {
        id: row.get("id"),
        run_id: row.get("run_id"),
        query_hash: row.get("query_hash"),
        query_text: row.get("query_text"),
        query_type: row.get("query_type"),
        category: row.get("category"),
        subcategory: row.get("subcategory"),
        year_start: row.get("year_start"),
        year_end: row.get("year_end"),
        status: status.parse()?,
        new_found: row.get("new_found"),
        updated_found: row.get("updated_found"),
        claimed_at: row.get("claimed_at"),
        completed_at: row.get("completed_at"),
    })
}

#[async_trait]
impl CatalogStore for SqliteStore {
    async fn catalog_snapshot(&self) -> Result<Vec<CatalogEntry>> {
        let rows = sqlx::query("SELECT id, identifier, title FROM records ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| CatalogEntry {
                id: row.get("id"),
                identifier: row.get("identifier"),
                title: row.get("title"),
            })
            .collect())
    }

    async fn insert_record(&self, record: &CandidateRecord) -> Result<InsertOutcome> {
        let _guard = self.write_lock.lock().await;
        let norm = record.normalized_identifier();
        let authors_json = serde_json::to_string(&record.authors)?;
        let ts = now();

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO records (title, identifier, identifier_norm, year, abstract, venue,
                                 url, pdf_url, authors_json, citation_count, source,
                                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.title)
        .bind(&record.identifier)
        .bind(&norm)
        .bind(record.year)
        .bind(&record.abstract_text)
        .bind(&record.venue)
        .bind(&record.url)
        .bind(&record.pdf_url)
        .bind(&authors_json)
        .bind(record.citation_count)
        .bind(&record.source)
        .bind(ts)
        .bind(ts)
        .execute(&mut *tx)
        .await;

        let id = match inserted {
            Ok(done) => done.last_insert_rowid(),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                tx.rollback().await?;
                let existing: Option<i64> = match &norm {
                    Some(n) => {
                        sqlx::query_scalar("SELECT id FROM records WHERE identifier_norm = ?")
                            .bind(n)
                            .fetch_optional(&self.pool)
                            .await?
                    }
                    None => None,
                };
                return Ok(InsertOutcome::Duplicate(existing));
            }
            Err(e) => return Err(e.into()),
        };

        sqlx::query(
            "INSERT OR IGNORE INTO record_sources (record_id, source, first_seen_at) VALUES (?, ?, ?)",
        )
        .bind(id)
        .bind(&record.source)
        .bind(ts)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(InsertOutcome::Inserted(id))
    }

    async fn add_record_source(&self, record_id: i64, source: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let ts = now();
        let added = sqlx::query(
            "INSERT OR IGNORE INTO record_sources (record_id, source, first_seen_at) VALUES (?, ?, ?)",
        )
        .bind(record_id)
        .bind(source)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        if added.rows_affected() > 0 {
            sqlx::query("UPDATE records SET updated_at = ? WHERE id = ?")
                .bind(ts)
                .bind(record_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<StoredRecord>> {
        let Some(norm) = harvest_core::dedup::normalize_identifier(identifier) else {
            return Ok(None);
        };
        let row = sqlx::query(&format!(
            "SELECT {} FROM records WHERE identifier_norm = ?",
            RECORD_COLUMNS
        ))
        .bind(&norm)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.stored_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn get_record(&self, id: i64) -> Result<Option<StoredRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM records WHERE id = ?", RECORD_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.stored_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn record_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn log_query(&self, entry: &QueryLogEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO search_queries (run_id, query_text, sources, results_returned,
                                        new_records, executed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.run_id)
        .bind(&entry.query_text)
        .bind(entry.sources.join(","))
        .bind(entry.results_returned)
        .bind(entry.new_records)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn start_run(&self, run_type: &str) -> Result<i64> {
        let _guard = self.write_lock.lock().await;
        let done = sqlx::query("INSERT INTO runs (run_type, status, started_at) VALUES (?, 'running', ?)")
            .bind(run_type)
            .bind(now())
            .execute(&self.pool)
            .await?;
        Ok(done.last_insert_rowid())
    }

    async fn complete_run(&self, run_id: i64, totals: &RunTotals) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            UPDATE runs SET status = 'completed', completed_at = ?,
                queries_executed = ?, records_added = ?, records_updated = ?
            WHERE id = ?
            "#,
        )
        .bind(now())
        .bind(totals.queries_executed)
        .bind(totals.records_added)
        .bind(totals.records_updated)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_run(&self, run_id: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE runs SET status = 'failed', completed_at = ? WHERE id = ?")
            .bind(now())
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn interrupt_search_run(&self, run_id: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "UPDATE runs SET status = 'interrupted', completed_at = ? \
             WHERE id = ? AND status != 'completed'",
        )
        .bind(now())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<Run>> {
        let row = sqlx::query(&format!("SELECT {} FROM runs WHERE id = ?", RUN_COLUMNS))
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM runs ORDER BY id DESC LIMIT ?",
            RUN_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn get_last_incomplete_run(&self, run_type: &str) -> Result<Option<Run>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM runs
            WHERE run_type = ? AND status IN ('running', 'interrupted')
            ORDER BY id DESC
            LIMIT 1
            "#,
            RUN_COLUMNS
        ))
        .bind(run_type)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn get_last_completed_run(&self) -> Result<Option<Run>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM runs WHERE status = 'completed' ORDER BY id DESC LIMIT 1",
            RUN_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn insert_checkpoint_batch(&self, run_id: i64, specs: &[CheckpointSpec]) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let ts = now();
        let mut inserted = 0;
        let mut tx = self.pool.begin().await?;
        for spec in specs {
            let done = sqlx::query(
                r#"
                INSERT OR IGNORE INTO checkpoints (run_id, query_hash, query_text, query_type,
                                                   category, subcategory, year_start, year_end,
                                                   status, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
                "#,
            )
            .bind(run_id)
            .bind(&spec.query_hash)
            .bind(&spec.query_text)
            .bind(&spec.query_type)
            .bind(&spec.category)
            .bind(&spec.subcategory)
            .bind(spec.year_start)
            .bind(spec.year_end)
            .bind(ts)
            .execute(&mut *tx)
            .await?;
            inserted += done.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_pending_checkpoints(&self, run_id: i64) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM checkpoints
            WHERE run_id = ? AND status = 'pending'
            ORDER BY id
            "#,
            CHECKPOINT_COLUMNS
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    async fn claim_checkpoint(&self, checkpoint_id: i64) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let done = sqlx::query(
            "UPDATE checkpoints SET status = 'in_progress', claimed_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now())
        .bind(checkpoint_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn release_stale_claims(&self, run_id: i64, older_than: Duration) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let cutoff = now() - older_than.as_secs() as i64;
        let done = sqlx::query(
            r#"
            UPDATE checkpoints SET status = 'pending', claimed_at = NULL
            WHERE run_id = ? AND status = 'in_progress'
              AND (claimed_at IS NULL OR claimed_at <= ?)
            "#,
        )
        .bind(run_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    async fn complete_checkpoint(&self, checkpoint_id: i64, counts: CheckpointCounts) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let done = sqlx::query(
            r#"
            UPDATE checkpoints
            SET status = 'completed', new_found = ?, updated_found = ?, completed_at = ?
            WHERE id = ? AND status IN ('pending', 'in_progress')
            "#,
        )
        .bind(counts.new_found)
        .bind(counts.updated_found)
        .bind(now())
        .bind(checkpoint_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn fail_checkpoint(&self, checkpoint_id: i64) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let done = sqlx::query(
            "UPDATE checkpoints SET status = 'failed' \
             WHERE id = ? AND status IN ('pending', 'in_progress')",
        )
        .bind(checkpoint_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn reset_failed_checkpoints(&self, run_id: i64) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let done = sqlx::query(
            "UPDATE checkpoints SET status = 'pending' WHERE run_id = ? AND status = 'failed'",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    async fn get_checkpoint_progress(&self, run_id: i64) -> Result<CheckpointProgress> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN status = 'in_progress' THEN 1 ELSE 0 END), 0) AS in_progress,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN new_found ELSE 0 END), 0) AS new_found,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN updated_found ELSE 0 END), 0) AS updated_found
            FROM checkpoints
            WHERE run_id = ?
            "#,
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(CheckpointProgress {
            total: row.get("total"),
            completed: row.get("completed"),
            failed: row.get("failed"),
            pending: row.get("pending"),
            in_progress: row.get("in_progress"),
            new_found: row.get("new_found"),
            updated_found: row.get("updated_found"),
        })
    }
}
