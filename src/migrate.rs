use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the catalog and ledger schema in the configured database.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(&config.db.path).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Idempotent schema creation on an open pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Create runs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'running',
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            queries_executed INTEGER NOT NULL DEFAULT 0,
            records_added INTEGER NOT NULL DEFAULT 0,
            records_updated INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create checkpoints table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL,
            query_hash TEXT NOT NULL,
            query_text TEXT NOT NULL,
            query_type TEXT,
            category TEXT,
            subcategory TEXT,
            year_start INTEGER,
            year_end INTEGER,
            status TEXT NOT NULL DEFAULT 'pending',
            new_found INTEGER NOT NULL DEFAULT 0,
            updated_found INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            claimed_at INTEGER,
            completed_at INTEGER,
            UNIQUE(run_id, query_hash),
            FOREIGN KEY (run_id) REFERENCES runs(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create records table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            identifier TEXT,
            identifier_norm TEXT UNIQUE,
            year INTEGER,
            abstract TEXT,
            venue TEXT,
            url TEXT,
            pdf_url TEXT,
            authors_json TEXT NOT NULL DEFAULT '[]',
            citation_count INTEGER,
            source TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create record_sources table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS record_sources (
            record_id INTEGER NOT NULL,
            source TEXT NOT NULL,
            first_seen_at INTEGER NOT NULL,
            PRIMARY KEY (record_id, source),
            FOREIGN KEY (record_id) REFERENCES records(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create search_queries audit table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_queries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL,
            query_text TEXT NOT NULL,
            sources TEXT NOT NULL,
            results_returned INTEGER NOT NULL DEFAULT 0,
            new_records INTEGER NOT NULL DEFAULT 0,
            executed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Ledgers created before checkpoint claiming lack claimed_at
    let has_claimed_at: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('checkpoints') WHERE name = 'claimed_at'",
    )
    .fetch_one(pool)
    .await?;
    if has_claimed_at == 0 {
        sqlx::query("ALTER TABLE checkpoints ADD COLUMN claimed_at INTEGER")
            .execute(pool)
            .await?;
    }

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_checkpoints_run_status ON checkpoints(run_id, status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_type_status ON runs(run_type, status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_year ON records(year)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_search_queries_run ON search_queries(run_id)")
        .execute(pool)
        .await?;

    Ok(())
}
