//! Duplicate detection against everything already seen.
//!
//! Identifier match first, then fuzzy title match. Title comparison is a
//! linear scan over every seen title.

use std::collections::{HashMap, HashSet};

use crate::models::{CandidateRecord, CatalogEntry};

/// Default similarity (0–100) at or above which two titles are the same.
pub const DEFAULT_TITLE_THRESHOLD: f64 = 90.0;

const IDENTIFIER_PREFIXES: &[&str] = &[
    "https://doi.org/",
    "http://doi.org/",
    "https://dx.doi.org/",
    "http://dx.doi.org/",
    "doi:",
];

/// Lowercase and strip resolver prefixes. `None` for blank input.
pub fn normalize_identifier(raw: &str) -> Option<String> {
    let mut id = raw.trim().to_lowercase();
    for prefix in IDENTIFIER_PREFIXES {
        if let Some(rest) = id.strip_prefix(prefix) {
            id = rest.trim().to_string();
            break;
        }
    }
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// Lowercase, drop punctuation, collapse whitespace.
pub fn normalize_title(raw: &str) -> String {
    let kept: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Similarity of two normalized titles on a 0–100 scale.
///
/// Normalized Indel similarity: `100 * (1 - indel / (len_a + len_b))`, where
/// the Indel distance counts insertions and deletions only. That equals
/// `200 * lcs / (len_a + len_b)`. Two empty strings score 100.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 100.0;
    }
    200.0 * longest_common_subsequence(&a, &b) as f64 / total as f64
}

fn longest_common_subsequence(a: &[char], b: &[char]) -> usize {
    let mut row = vec![0usize; b.len() + 1];
    for ca in a {
        let mut diagonal = 0;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if ca == cb {
                diagonal + 1
            } else {
                above.max(row[j])
            };
            diagonal = above;
        }
    }
    row[b.len()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupVerdict {
    Unique,
    /// `existing_id` is known when the match came from a registered record
    /// that had a catalog id.
    Duplicate { existing_id: Option<i64> },
}

impl DedupVerdict {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DedupVerdict::Duplicate { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Deduplicator {
    title_threshold: f64,
    seen_identifiers: HashSet<String>,
    identifier_ids: HashMap<String, i64>,
    seen_titles: Vec<(String, Option<i64>)>,
}

impl Deduplicator {
    pub fn new(title_threshold: f64) -> Self {
        Self {
            title_threshold,
            seen_identifiers: HashSet::new(),
            identifier_ids: HashMap::new(),
            seen_titles: Vec::new(),
        }
    }

    /// Replace seen state with the catalog contents.
    pub fn load_existing(&mut self, catalog: &[CatalogEntry]) {
        self.seen_identifiers.clear();
        self.identifier_ids.clear();
        self.seen_titles.clear();
        for entry in catalog {
            self.remember(entry.identifier.as_deref(), &entry.title, Some(entry.id));
        }
    }

    pub fn is_duplicate(&self, record: &CandidateRecord) -> DedupVerdict {
        if let Some(id) = record.normalized_identifier() {
            if self.seen_identifiers.contains(&id) {
                return DedupVerdict::Duplicate {
                    existing_id: self.identifier_ids.get(&id).copied(),
                };
            }
        }

        let title = normalize_title(&record.title);
        if title.is_empty() {
            return DedupVerdict::Unique;
        }
        for (seen, existing_id) in &self.seen_titles {
            if title_similarity(&title, seen) >= self.title_threshold {
                return DedupVerdict::Duplicate {
                    existing_id: *existing_id,
                };
            }
        }
        DedupVerdict::Unique
    }

    /// Mark `record` as seen, optionally tied to its catalog id.
    pub fn register(&mut self, record: &CandidateRecord, id: Option<i64>) {
        self.remember(record.identifier.as_deref(), &record.title, id);
    }

    fn remember(&mut self, identifier: Option<&str>, title: &str, id: Option<i64>) {
        if let Some(norm) = identifier.and_then(normalize_identifier) {
            if let Some(id) = id {
                self.identifier_ids.insert(norm.clone(), id);
            }
            self.seen_identifiers.insert(norm);
        }
        let title = normalize_title(title);
        if !title.is_empty() {
            self.seen_titles.push((title, id));
        }
    }

    pub fn seen_titles(&self) -> usize {
        self.seen_titles.len()
    }

    /// Keep records that are neither already seen nor near-copies of an
    /// earlier record in `records`. Kept records are registered.
    pub fn retain_unique<I>(&mut self, records: I) -> Vec<CandidateRecord>
    where
        I: IntoIterator<Item = CandidateRecord>,
    {
        let mut kept = Vec::new();
        for record in records {
            if !self.is_duplicate(&record).is_duplicate() {
                self.register(&record, None);
                kept.push(record);
            }
        }
        kept
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_TITLE_THRESHOLD)
    }
}
