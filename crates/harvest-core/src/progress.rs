//! Batch progress events.
//!
//! The batch driver emits these; how they are rendered (human or JSON on
//! stderr, or not at all) is up to the caller's reporter.

use crate::models::CheckpointStatus;

/// A single progress event for a batch run.
#[derive(Clone, Debug, PartialEq)]
pub enum BatchProgressEvent {
    /// The run is about to process `pending` checkpoints.
    Started {
        run_id: i64,
        seeded: u64,
        pending: u64,
        resumed: bool,
    },
    /// One checkpoint finished; `done` of `total` for this session.
    Checkpoint {
        run_id: i64,
        query: String,
        status: CheckpointStatus,
        new_found: i64,
        updated_found: i64,
        done: u64,
        total: u64,
    },
    /// The run stopped, either cleanly or by interruption.
    Finished {
        run_id: i64,
        records_added: i64,
        records_updated: i64,
        failed: u64,
        interrupted: bool,
    },
}

/// Receives batch progress. Called from worker tasks, so it must be cheap
/// and thread-safe.
pub trait BatchProgressReporter: Send + Sync {
    fn report(&self, event: BatchProgressEvent);
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl BatchProgressReporter for NoProgress {
    fn report(&self, _event: BatchProgressEvent) {}
}
