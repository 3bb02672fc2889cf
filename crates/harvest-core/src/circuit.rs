//! Per-source circuit breakers.
//!
//! The Open → HalfOpen transition is evaluated when the state is read, not
//! by a timer. A breaker nobody asks about stays open.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::policy::PolicySet;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_HALF_OPEN_MAX_CALLS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_calls: u32,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_calls: 0,
                last_failure: None,
            }),
        }
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock and apply the lazy Open → HalfOpen transition.
    fn observe(&self) -> MutexGuard<'_, BreakerInner> {
        let mut inner = self.lock();
        if inner.state == CircuitState::Open {
            let recovered = inner
                .last_failure
                .map_or(true, |at| at.elapsed() >= self.recovery_timeout);
            if recovered {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_calls = 0;
                inner.success_count = 0;
                info!(source = %self.name, "circuit half-open, allowing trial call");
            }
        }
        inner
    }

    pub fn state(&self) -> CircuitState {
        self.observe().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Whether a call may be attempted now.
    pub fn is_available(&self) -> bool {
        let inner = self.observe();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => inner.half_open_calls < self.half_open_max_calls,
            CircuitState::Open => false,
        }
    }

    /// Check availability and reserve a trial slot under one lock.
    ///
    /// Returns `false` when the call must not go out. While half-open, at
    /// most `half_open_max_calls` callers get `true` until an outcome is
    /// recorded.
    pub fn try_begin_call(&self) -> bool {
        let mut inner = self.observe();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen if inner.half_open_calls < self.half_open_max_calls => {
                inner.half_open_calls += 1;
                true
            }
            CircuitState::HalfOpen | CircuitState::Open => false,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.observe();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.half_open_max_calls {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.half_open_calls = 0;
                    info!(source = %self.name, "circuit closed");
                }
            }
            _ => inner.failure_count = 0,
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.observe();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.half_open_calls = 0;
                inner.success_count = 0;
                warn!(source = %self.name, "trial call failed, circuit reopened");
            }
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    source = %self.name,
                    failures = inner.failure_count,
                    "circuit opened"
                );
            }
            _ => {}
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStatus {
    pub source: String,
    pub state: CircuitState,
    pub failures: u32,
    pub available: bool,
}

/// Breakers keyed by source name. Unknown sources get the default tuning.
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    tuning: HashMap<String, (u32, Duration, u32)>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            tuning: HashMap::new(),
        }
    }

    pub fn from_policies(policies: &PolicySet) -> Self {
        let mut registry = Self::new();
        for (name, policy) in policies.iter() {
            registry.tuning.insert(
                name.to_string(),
                (
                    policy.failure_threshold,
                    policy.recovery_timeout,
                    policy.half_open_max_calls,
                ),
            );
        }
        registry
    }

    /// Install (or replace) the breaker for `source`.
    pub fn register(&self, breaker: CircuitBreaker) {
        self.lock()
            .insert(breaker.name().to_string(), Arc::new(breaker));
    }

    pub fn get(&self, source: &str) -> Arc<CircuitBreaker> {
        let (threshold, recovery, trial_calls) = self.tuning.get(source).copied().unwrap_or((
            DEFAULT_FAILURE_THRESHOLD,
            DEFAULT_RECOVERY_TIMEOUT,
            DEFAULT_HALF_OPEN_MAX_CALLS,
        ));
        self.lock()
            .entry(source.to_string())
            .or_insert_with(|| {
                Arc::new(
                    CircuitBreaker::new(source, threshold, recovery)
                        .with_half_open_max_calls(trial_calls),
                )
            })
            .clone()
    }

    pub fn is_available(&self, source: &str) -> bool {
        self.get(source).is_available()
    }

    pub fn try_begin_call(&self, source: &str) -> bool {
        self.get(source).try_begin_call()
    }

    pub fn record_success(&self, source: &str) {
        self.get(source).record_success();
    }

    pub fn record_failure(&self, source: &str) {
        self.get(source).record_failure();
    }

    /// Status of every breaker created so far, sorted by source.
    pub fn status(&self) -> Vec<CircuitStatus> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        let mut out: Vec<CircuitStatus> = breakers
            .iter()
            .map(|b| CircuitStatus {
                source: b.name().to_string(),
                available: b.is_available(),
                state: b.state(),
                failures: b.failure_count(),
            })
            .collect();
        out.sort_by(|a, b| a.source.cmp(&b.source));
        out
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tripped() -> CircuitBreaker {
        let breaker = CircuitBreaker::new("crossref", 3, Duration::from_secs(10));
        for _ in 0..3 {
            assert!(breaker.try_begin_call());
            breaker.record_failure();
        }
        breaker
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold() {
        let breaker = CircuitBreaker::new("crossref", 3, Duration::from_secs(10));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_available());
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert!(!breaker.is_available());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_recovery_then_closes_on_success() {
        let breaker = tripped();
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!breaker.is_available());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.is_available());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(breaker.try_begin_call());
        assert!(!breaker.is_available(), "only one trial call allowed");
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_while_half_open_reopens() {
        let breaker = tripped();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_begin_call());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_trial_slots_are_reserved_atomically() {
        let breaker = tripped();
        tokio::time::advance(Duration::from_secs(10)).await;

        // Every caller sees availability before any of them starts.
        assert!(breaker.is_available());
        assert!(breaker.is_available());
        assert!(breaker.try_begin_call());
        assert!(!breaker.try_begin_call());
        assert!(!breaker.try_begin_call());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_begin_call());
        assert!(breaker.try_begin_call());
    }

    #[tokio::test(start_paused = true)]
    async fn registry_applies_trial_call_budget() {
        let policies = PolicySet::new().with(
            "crossref",
            crate::policy::SourcePolicy {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(5),
                half_open_max_calls: 2,
                ..Default::default()
            },
        );
        let registry = CircuitBreakerRegistry::from_policies(&policies);
        registry.record_failure("crossref");
        assert!(!registry.try_begin_call("crossref"));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(registry.try_begin_call("crossref"));
        assert!(registry.try_begin_call("crossref"));
        assert!(!registry.try_begin_call("crossref"));
    }

    #[tokio::test(start_paused = true)]
    async fn success_while_closed_resets_failures() {
        let breaker = CircuitBreaker::new("crossref", 3, Duration::from_secs(10));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_uses_policy_tuning_and_reports_status() {
        let policies = PolicySet::new().with(
            "flaky",
            crate::policy::SourcePolicy {
                failure_threshold: 1,
                ..Default::default()
            },
        );
        let registry = CircuitBreakerRegistry::from_policies(&policies);
        registry.record_failure("flaky");
        registry.record_failure("steady");

        let status = registry.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].source, "flaky");
        assert_eq!(status[0].state, CircuitState::Open);
        assert!(!status[0].available);
        assert_eq!(status[1].source, "steady");
        assert_eq!(status[1].failures, 1);
        assert!(status[1].available);
    }
}
