//! Reciprocal rank fusion across per-source result lists.

use std::collections::{BTreeSet, HashMap};

use crate::models::CandidateRecord;

pub const DEFAULT_RRF_K: u32 = 60;

/// One merged result.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedRecord {
    /// Dedup key the lists were merged on.
    pub key: String,
    pub score: f64,
    /// The richest version seen for this key.
    pub record: CandidateRecord,
    /// Every source whose list contained this key.
    pub sources: BTreeSet<String>,
}

/// Merge ranked lists into one list ordered by descending fused score.
///
/// A candidate at 0-based position `rank` contributes `1 / (k + rank + 1)`.
/// Scores for the same key add up. Equal scores keep first-seen order.
pub fn reciprocal_rank_fusion(lists: &[Vec<CandidateRecord>], k: u32) -> Vec<FusedRecord> {
    let k = f64::from(k);
    let mut fused: Vec<FusedRecord> = Vec::new();
    let mut slots: HashMap<String, usize> = HashMap::new();

    for list in lists {
        for (rank, record) in list.iter().enumerate() {
            let contribution = 1.0 / (k + rank as f64 + 1.0);
            let key = record.dedup_key();
            match slots.get(&key) {
                Some(&slot) => {
                    let entry = &mut fused[slot];
                    entry.score += contribution;
                    entry.sources.insert(record.source.clone());
                    if record.richness() > entry.record.richness() {
                        entry.record = record.clone();
                    }
                }
                None => {
                    slots.insert(key.clone(), fused.len());
                    fused.push(FusedRecord {
                        key,
                        score: contribution,
                        record: record.clone(),
                        sources: BTreeSet::from([record.source.clone()]),
                    });
                }
            }
        }
    }

    fused.sort_by(|a, b| b.score.total_cmp(&a.score));
    fused
}
