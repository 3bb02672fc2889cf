//! Memoized per-source search responses.
//!
//! Entries are keyed by a SHA-256 over a canonical (sorted-key) JSON
//! encoding of `{api, query, params}`, so the key does not depend on the
//! order parameters were inserted in.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::models::CandidateRecord;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_SIZE_LIMIT_BYTES: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub bytes: u64,
}

/// A store of prior source responses with per-entry expiry.
#[async_trait]
pub trait SearchCache: Send + Sync {
    async fn get(
        &self,
        source: &str,
        query: &str,
        params: &Value,
    ) -> Result<Option<Vec<CandidateRecord>>>;

    /// Store `records`. `ttl` of `None` uses the cache's default lifetime.
    async fn set(
        &self,
        source: &str,
        query: &str,
        records: &[CandidateRecord],
        params: &Value,
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Drop every entry, returning how many were removed.
    async fn clear(&self) -> Result<u64>;

    async fn stats(&self) -> Result<CacheStats>;
}

/// Deterministic cache key for one source call.
pub fn cache_key(source: &str, query: &str, params: &Value) -> String {
    let material = canonical(&json!({
        "api": source,
        "query": query,
        "params": params,
    }));
    format!("{:x}", Sha256::digest(material.to_string().as_bytes()))
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonical(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

struct MemoryEntry {
    records: Vec<CandidateRecord>,
    bytes: u64,
    expires_at: Instant,
    last_access: u64,
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, MemoryEntry>,
    total_bytes: u64,
    clock: u64,
}

impl MemoryState {
    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.total_bytes -= entry.bytes;
        }
    }

    fn evict(&mut self, size_limit: u64) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
        while self.total_bytes > size_limit {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => self.remove(&key),
                None => break,
            }
        }
    }
}

/// In-process cache with TTL and least-recently-used eviction under a
/// byte ceiling. Sizes are measured as serialized JSON.
pub struct MemoryCache {
    default_ttl: Duration,
    size_limit: u64,
    state: Mutex<MemoryState>,
}

impl MemoryCache {
    pub fn new(default_ttl: Duration, size_limit: u64) -> Self {
        Self {
            default_ttl,
            size_limit,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory cache lock poisoned"))
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL, DEFAULT_SIZE_LIMIT_BYTES)
    }
}

#[async_trait]
impl SearchCache for MemoryCache {
    async fn get(
        &self,
        source: &str,
        query: &str,
        params: &Value,
    ) -> Result<Option<Vec<CandidateRecord>>> {
        let key = cache_key(source, query, params);
        let mut state = self.lock()?;
        state.clock += 1;
        let tick = state.clock;
        let expired = match state.entries.get_mut(&key) {
            None => return Ok(None),
            Some(entry) if entry.expires_at <= Instant::now() => true,
            Some(entry) => {
                entry.last_access = tick;
                return Ok(Some(entry.records.clone()));
            }
        };
        if expired {
            state.remove(&key);
        }
        Ok(None)
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
        let bytes = serde_json::to_vec(records)?.len() as u64;
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut state = self.lock()?;
        state.remove(&key);
        state.clock += 1;
        let tick = state.clock;
        state.entries.insert(
            key,
            MemoryEntry {
                records: records.to_vec(),
                bytes,
                expires_at: Instant::now() + ttl,
                last_access: tick,
            },
        );
        state.total_bytes += bytes;
        let limit = self.size_limit;
        state.evict(limit);
        Ok(())
    }

    async fn clear(&self) -> Result<u64> {
        let mut state = self.lock()?;
        let removed = state.entries.len() as u64;
        state.entries.clear();
        state.total_bytes = 0;
        Ok(removed)
    }

    async fn stats(&self) -> Result<CacheStats> {
        let state = self.lock()?;
        Ok(CacheStats {
            entries: state.entries.len() as u64,
            bytes: state.total_bytes,
        })
    }
}
