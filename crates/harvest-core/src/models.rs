//! Core data models shared by the orchestrator, the ledger, and storage.
//!
//! Candidate records flow in from sources, get fused and deduplicated, and
//! land in the catalog as stored records. Runs and checkpoints describe the
//! batch work that produced them.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::dedup::{normalize_identifier, normalize_title};

/// Run type for a full historical backfill.
pub const RUN_TYPE_HISTORICAL: &str = "historical_build";
/// Run type for an incremental refresh since a cutoff year.
pub const RUN_TYPE_REFRESH: &str = "incremental_refresh";

/// One result returned by one source for one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub title: String,
    /// DOI or other persistent identifier, as the source reported it.
    pub identifier: Option<String>,
    pub year: Option<i32>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub venue: Option<String>,
    pub url: Option<String>,
    pub pdf_url: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    pub citation_count: Option<i64>,
    /// Name of the source that produced this candidate.
    pub source: String,
}

impl CandidateRecord {
    pub fn new(title: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    pub fn with_abstract(mut self, text: impl Into<String>) -> Self {
        self.abstract_text = Some(text.into());
        self
    }

    /// Weighted count of populated optional fields. An abstract is worth
    /// three, an identifier two, everything else one.
    pub fn richness(&self) -> u32 {
        fn present(s: &Option<String>) -> bool {
            s.as_deref().is_some_and(|v| !v.trim().is_empty())
        }

        let mut score = 0;
        if present(&self.abstract_text) {
            score += 3;
        }
        if present(&self.identifier) {
            score += 2;
        }
        if self.year.is_some() {
            score += 1;
        }
        if !self.authors.is_empty() {
            score += 1;
        }
        if present(&self.venue) {
            score += 1;
        }
        if present(&self.pdf_url) {
            score += 1;
        }
        if self.citation_count.is_some() {
            score += 1;
        }
        if present(&self.url) {
            score += 1;
        }
        score
    }

    /// Normalized identifier, if the record carries a usable one.
    pub fn normalized_identifier(&self) -> Option<String> {
        self.identifier.as_deref().and_then(normalize_identifier)
    }

    /// Key used to collapse the same logical record across sources:
    /// `doi:<normalized identifier>` when present, else `title:<normalized title>`.
    pub fn dedup_key(&self) -> String {
        match self.normalized_identifier() {
            Some(id) => format!("doi:{}", id),
            None => format!("title:{}", normalize_title(&self.title)),
        }
    }
}

/// A canonical catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub id: i64,
    pub title: String,
    pub identifier: Option<String>,
    pub year: Option<i32>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub venue: Option<String>,
    pub url: Option<String>,
    pub pdf_url: Option<String>,
    pub authors: Vec<String>,
    pub citation_count: Option<i64>,
    /// Every source that has returned this record, sorted.
    pub sources: Vec<String>,
    pub created_at: i64,
}

/// The slice of a stored record the deduplicator needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub id: i64,
    pub identifier: Option<String>,
    pub title: String,
}

/// A query as handed to a single source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchQuery {
    pub query: String,
    pub max_results: usize,
    pub year_start: Option<i32>,
    pub year_end: Option<i32>,
}

/// What a source returns for one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub records: Vec<CandidateRecord>,
    /// Total hits the source claims to have, which may exceed `records.len()`.
    pub total_count: Option<u64>,
}

impl SearchResponse {
    pub fn new(records: Vec<CandidateRecord>) -> Self {
        let total = records.len() as u64;
        Self {
            records,
            total_count: Some(total),
        }
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Interrupted,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Interrupted => "interrupted",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    /// Running and interrupted runs are eligible for resume.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Interrupted)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "running" => RunStatus::Running,
            "interrupted" => RunStatus::Interrupted,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            other => bail!("unknown run status '{}'", other),
        })
    }
}

/// One batch execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    pub id: i64,
    pub run_type: String,
    pub status: RunStatus,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub queries_executed: i64,
    pub records_added: i64,
    pub records_updated: i64,
}

/// Aggregate counters written when a run completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub queries_executed: i64,
    pub records_added: i64,
    pub records_updated: i64,
}

/// Status of one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    /// Claimed by a worker that has not reported back yet.
    InProgress,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::InProgress => "in_progress",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        }
    }

    /// Pending or claimed; not yet completed or failed.
    pub fn is_open(&self) -> bool {
        matches!(self, CheckpointStatus::Pending | CheckpointStatus::InProgress)
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "pending" => CheckpointStatus::Pending,
            "in_progress" => CheckpointStatus::InProgress,
            "completed" => CheckpointStatus::Completed,
            "failed" => CheckpointStatus::Failed,
            other => bail!("unknown checkpoint status '{}'", other),
        })
    }
}

/// Planned work for one checkpoint, before it is seeded into a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSpec {
    pub query_hash: String,
    pub query_text: String,
    pub query_type: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub year_start: Option<i32>,
    pub year_end: Option<i32>,
}

impl CheckpointSpec {
    /// A bare spec: just the query, hashed on its text.
    pub fn for_query(query_text: impl Into<String>) -> Self {
        let query_text = query_text.into();
        Self {
            query_hash: short_hash(&query_text),
            query_text,
            query_type: None,
            category: None,
            subcategory: None,
            year_start: None,
            year_end: None,
        }
    }
}

/// A seeded checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    pub id: i64,
    pub run_id: i64,
    pub query_hash: String,
    pub query_text: String,
    pub query_type: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub year_start: Option<i32>,
    pub year_end: Option<i32>,
    pub status: CheckpointStatus,
    pub new_found: i64,
    pub updated_found: i64,
    pub claimed_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// Result counters recorded when a checkpoint completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointCounts {
    pub new_found: i64,
    pub updated_found: i64,
}

impl CheckpointCounts {
    pub fn new(new_found: i64, updated_found: i64) -> Self {
        Self {
            new_found,
            updated_found,
        }
    }
}

/// Aggregate snapshot of a run's checkpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckpointProgress {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub pending: i64,
    pub in_progress: i64,
    /// Summed over completed checkpoints only.
    pub new_found: i64,
    /// Summed over completed checkpoints only.
    pub updated_found: i64,
}

impl CheckpointProgress {
    pub fn is_finished(&self) -> bool {
        self.pending == 0 && self.in_progress == 0 && self.failed == 0
    }
}

/// An audit row for one executed query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryLogEntry {
    pub run_id: i64,
    pub query_text: String,
    pub sources: Vec<String>,
    pub results_returned: i64,
    pub new_records: i64,
}

/// One query a batch planner wants executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub query: String,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub query_type: String,
    pub year_start: Option<i32>,
    pub year_end: Option<i32>,
    /// Empty means every registered source.
    #[serde(default)]
    pub target_sources: Vec<String>,
}

impl QueryPlan {
    pub fn new(query: impl Into<String>, query_type: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            category: None,
            subcategory: None,
            query_type: query_type.into(),
            year_start: None,
            year_end: None,
            target_sources: Vec::new(),
        }
    }

    pub fn with_years(mut self, start: Option<i32>, end: Option<i32>) -> Self {
        self.year_start = start;
        self.year_end = end;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>, subcategory: Option<String>) -> Self {
        self.category = Some(category.into());
        self.subcategory = subcategory;
        self
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_sources = sources.into_iter().map(Into::into).collect();
        self
    }

    /// Stable 16-hex-char hash over query, type, year window and the sorted
    /// target sources. Two plans with the same hash are the same work.
    pub fn hash(&self) -> String {
        let mut sources: Vec<&str> = self.target_sources.iter().map(String::as_str).collect();
        sources.sort_unstable();
        let year = |y: Option<i32>| y.map(|v| v.to_string()).unwrap_or_else(|| "None".to_string());
        let material = format!(
            "{}|{}|{}|{}|{}",
            self.query,
            self.query_type,
            year(self.year_start),
            year(self.year_end),
            sources.join(",")
        );
        short_hash(&material)
    }

    pub fn to_spec(&self) -> CheckpointSpec {
        CheckpointSpec {
            query_hash: self.hash(),
            query_text: self.query.clone(),
            query_type: Some(self.query_type.clone()),
            category: self.category.clone(),
            subcategory: self.subcategory.clone(),
            year_start: self.year_start,
            year_end: self.year_end,
        }
    }
}

fn short_hash(material: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(material.as_bytes()));
    digest[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn richness_weights_abstract_and_identifier() {
        let bare = CandidateRecord::new("Soy ink", "crossref");
        assert_eq!(bare.richness(), 0);

        let rich = CandidateRecord::new("Soy ink", "crossref")
            .with_identifier("10.1/x")
            .with_abstract("printing inks")
            .with_year(2020);
        assert_eq!(rich.richness(), 6);
    }

    #[test]
    fn blank_fields_do_not_count_as_rich() {
        let mut rec = CandidateRecord::new("Soy ink", "crossref");
        rec.abstract_text = Some("   ".into());
        rec.venue = Some(String::new());
        assert_eq!(rec.richness(), 0);
    }

    #[test]
    fn dedup_key_prefers_identifier() {
        let rec = CandidateRecord::new("Soy Ink!", "a").with_identifier("https://doi.org/10.5/ABC");
        assert_eq!(rec.dedup_key(), "doi:10.5/abc");

        let rec = CandidateRecord::new("Soy  Ink!", "a");
        assert_eq!(rec.dedup_key(), "title:soy ink");
    }

    #[test]
    fn plan_hash_ignores_source_order() {
        let a = QueryPlan::new("soy foam", "application").with_sources(["b", "a"]);
        let b = QueryPlan::new("soy foam", "application").with_sources(["a", "b"]);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 16);
    }

    #[test]
    fn plan_hash_depends_on_year_window() {
        let a = QueryPlan::new("soy foam", "application").with_years(Some(2000), Some(2005));
        let b = QueryPlan::new("soy foam", "application").with_years(Some(2006), Some(2010));
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.to_spec().query_hash, a.hash());
        assert_eq!(a.to_spec().year_start, Some(2000));
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in ["running", "interrupted", "completed", "failed"] {
            assert_eq!(s.parse::<RunStatus>().unwrap().as_str(), s);
        }
        for s in ["pending", "in_progress", "completed", "failed"] {
            assert_eq!(s.parse::<CheckpointStatus>().unwrap().as_str(), s);
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }
}
