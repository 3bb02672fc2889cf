//! Per-source token-bucket rate limiting.
//!
//! Refill is continuous and computed lazily on each call; there is no
//! background timer. Each bucket has its own lock, so concurrent callers on
//! one source never double-spend a token, and callers on different sources
//! never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::policy::PolicySet;

/// Requests per second for sources with no registered policy.
pub const DEFAULT_RATE: f64 = 1.0;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket with a steady refill rate and a burst capacity.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket. A missing or zero `burst` means
    /// `ceil(rate)`, minimum 1.
    pub fn new(rate: f64, burst: Option<u32>) -> Self {
        let rate = if rate.is_finite() && rate > 0.0 {
            rate
        } else {
            DEFAULT_RATE
        };
        let capacity = match burst {
            Some(b) if b > 0 => f64::from(b),
            _ => rate.ceil().max(1.0),
        };
        Self {
            rate,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;
    }

    /// Wait until a token is available, then take it.
    ///
    /// The bucket lock is held while sleeping, so waiters queue behind the
    /// current one in lock order.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        loop {
            self.refill(&mut state);
            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return;
            }
            let wait = (1.0 - state.tokens) / self.rate;
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    /// Take a token if one is available right now. Returns `false` without
    /// waiting when the bucket is empty or another caller holds it.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut state) = self.state.try_lock() else {
            return false;
        };
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Buckets keyed by source name.
pub struct RateLimiterRegistry {
    buckets: StdMutex<HashMap<String, Arc<TokenBucket>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self {
            buckets: StdMutex::new(HashMap::new()),
        }
    }

    /// One bucket per named source policy.
    pub fn from_policies(policies: &PolicySet) -> Self {
        let registry = Self::new();
        for (name, policy) in policies.iter() {
            registry.register(name, policy.rate_qps, policy.burst);
        }
        registry
    }

    /// Install (or replace) the bucket for `source`.
    pub fn register(&self, source: &str, rate: f64, burst: Option<u32>) {
        let bucket = Arc::new(TokenBucket::new(rate, burst));
        debug!(source, rate = bucket.rate(), capacity = bucket.capacity(), "rate limiter registered");
        self.lock().insert(source.to_string(), bucket);
    }

    /// The bucket for `source`, created at 1 request/sec, burst 1 if unknown.
    pub fn get(&self, source: &str) -> Arc<TokenBucket> {
        self.lock()
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(DEFAULT_RATE, Some(1))))
            .clone()
    }

    pub async fn acquire(&self, source: &str) {
        let bucket = self.get(source);
        bucket.acquire().await;
    }

    pub fn try_acquire(&self, source: &str) -> bool {
        self.get(source).try_acquire()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<TokenBucket>>> {
        self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
