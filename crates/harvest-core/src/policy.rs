//! Per-source operating policy: pace, breaker tuning, cache lifetime and
//! request timeout.

use std::collections::HashMap;
use std::time::Duration;

/// Tuning for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePolicy {
    pub rate_qps: f64,
    /// Bucket capacity. `None` means `ceil(rate_qps)`, minimum 1.
    pub burst: Option<u32>,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    /// Trial calls let through while half-open.
    pub half_open_max_calls: u32,
    pub cache_ttl: Duration,
    pub timeout: Duration,
}

impl Default for SourcePolicy {
    fn default() -> Self {
        Self {
            rate_qps: 1.0,
            burst: None,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            cache_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Named policies plus the fallback used for everything else.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    fallback: SourcePolicy,
    named: HashMap<String, SourcePolicy>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: impl Into<String>, policy: SourcePolicy) {
        self.named.insert(source.into(), policy);
    }

    pub fn with(mut self, source: impl Into<String>, policy: SourcePolicy) -> Self {
        self.insert(source, policy);
        self
    }

    pub fn get(&self, source: &str) -> &SourcePolicy {
        self.named.get(source).unwrap_or(&self.fallback)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SourcePolicy)> {
        self.named.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.named.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_source_falls_back_to_defaults() {
        let set = PolicySet::new().with(
            "openalex",
            SourcePolicy {
                rate_qps: 10.0,
                ..Default::default()
            },
        );
        assert_eq!(set.get("openalex").rate_qps, 10.0);
        assert_eq!(set.get("nobody"), &SourcePolicy::default());
        assert_eq!(set.len(), 1);
    }
}
