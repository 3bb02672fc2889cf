//! SQLite-backed [`SearchCache`] in its own database file.
//!
//! Expired entries are dropped on read and on every write. After each write,
//! least-recently-accessed entries are evicted until the stored payload fits
//! under the byte ceiling.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::debug;

use harvest_core::cache::{cache_key, CacheStats, SearchCache};
use harvest_core::models::CandidateRecord;

use crate::config::CacheConfig;
use crate::db;

pub struct SqliteCache {
    pool: SqlitePool,
    default_ttl: Duration,
    size_limit: u64,
    write_lock: Mutex<()>,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl SqliteCache {
    pub async fn open(path: &Path, default_ttl: Duration, size_limit: u64) -> Result<Self> {
        let pool = db::connect(path).await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                value TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                last_access INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_last_access ON cache_entries(last_access)")
            .execute(&pool)
            .await?;

        Ok(Self {
            pool,
            default_ttl,
            size_limit,
            write_lock: Mutex::new(()),
        })
    }

    pub async fn from_config(config: &CacheConfig) -> Result<Self> {
        Self::open(
            &config.path,
            Duration::from_secs(config.ttl_secs),
            config.size_limit_bytes,
        )
        .await
    }

    async fn evict(&self) -> Result<()> {
        let expired = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(now_millis())
            .execute(&self.pool)
            .await?
            .rows_affected();

        let mut total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(size_bytes), 0) FROM cache_entries")
            .fetch_one(&self.pool)
            .await?;
        let limit = i64::try_from(self.size_limit).unwrap_or(i64::MAX);
        let mut evicted = 0u64;
        if total > limit {
            let rows = sqlx::query("SELECT key, size_bytes FROM cache_entries ORDER BY last_access, rowid")
                .fetch_all(&self.pool)
                .await?;
            for row in rows {
                if total <= limit {
                    break;
                }
                let key: String = row.get("key");
                let size: i64 = row.get("size_bytes");
                sqlx::query("DELETE FROM cache_entries WHERE key = ?")
                    .bind(&key)
                    .execute(&self.pool)
                    .await?;
                total -= size;
                evicted += 1;
            }
        }
        if expired > 0 || evicted > 0 {
            debug!(expired, evicted, "cache entries evicted");
        }
        Ok(())
    }
}

#[async_trait]
impl SearchCache for SqliteCache {
    async fn get(
        &self,
        source: &str,
        query: &str,
        params: &Value,
    ) -> Result<Option<Vec<CandidateRecord>>> {
        let key = cache_key(source, query, params);
        let row = sqlx::query("SELECT value, expires_at FROM cache_entries WHERE key = ?")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let now = now_millis();
        let expires_at: i64 = row.get("expires_at");
        let _guard = self.write_lock.lock().await;
        if expires_at <= now {
            sqlx::query("DELETE FROM cache_entries WHERE key = ?")
                .bind(&key)
                .execute(&self.pool)
                .await?;
            return Ok(None);
        }

        let value: String = row.get("value");
        match serde_json::from_str::<Vec<CandidateRecord>>(&value) {
            Ok(records) => {
                sqlx::query("UPDATE cache_entries SET last_access = ? WHERE key = ?")
                    .bind(now)
                    .bind(&key)
                    .execute(&self.pool)
                    .await?;
                Ok(Some(records))
            }
            Err(e) => {
                debug!(source, error = %e, "dropping undecodable cache entry");
                sqlx::query("DELETE FROM cache_entries WHERE key = ?")
                    .bind(&key)
                    .execute(&self.pool)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn set(
        &self,
        source: &str,
        query: &str,
        records: &[CandidateRecord],
        params: &Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key = cache_key(source, query, params);
        let value = serde_json::to_string(records)?;
        let ttl = ttl.unwrap_or(self.default_ttl);
        let now = now_millis();
        let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));

        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO cache_entries
                (key, source, value, size_bytes, created_at, expires_at, last_access)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&key)
        .bind(source)
        .bind(&value)
        .bind(value.len() as i64)
        .bind(now)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.evict().await
    }

    async fn clear(&self) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let done = sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    async fn stats(&self) -> Result<CacheStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS entries, COALESCE(SUM(size_bytes), 0) AS bytes FROM cache_entries",
        )
        .fetch_one(&self.pool)
        .await?;
        let entries: i64 = row.get("entries");
        let bytes: i64 = row.get("bytes");
        Ok(CacheStats {
            entries: entries.max(0) as u64,
            bytes: bytes.max(0) as u64,
        })
    }
}
