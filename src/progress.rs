//! Batch progress reporting.
//!
//! Reports observable progress while a batch runs so operators see which
//! queries finished, how much is left, and how many records landed.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::sync::Arc;

use harvest_core::models::CheckpointProgress;
use harvest_core::progress::{BatchProgressEvent, BatchProgressReporter, NoProgress};

/// Human-friendly progress on stderr: "run 4  [  120 / 2,000]  completed  soy adhesive  +3 new".
pub struct StderrProgress;

impl BatchProgressReporter for StderrProgress {
    fn report(&self, event: BatchProgressEvent) {
        let line = match &event {
            BatchProgressEvent::Started {
                run_id,
                seeded,
                pending,
                resumed,
            } => {
                let verb = if *resumed { "resuming" } else { "starting" };
                format!(
                    "run {}  {}  {} pending ({} newly seeded)\n",
                    run_id,
                    verb,
                    format_number(*pending),
                    format_number(*seeded)
                )
            }
            BatchProgressEvent::Checkpoint {
                run_id,
                query,
                status,
                new_found,
                updated_found,
                done,
                total,
            } => format!(
                "run {}  [{} / {}]  {}  {}  +{} new, {} updated\n",
                run_id,
                format_number(*done),
                format_number(*total),
                status,
                query,
                new_found,
                updated_found
            ),
            BatchProgressEvent::Finished {
                run_id,
                records_added,
                records_updated,
                failed,
                interrupted,
            } => {
                let outcome = if *interrupted { "interrupted" } else { "completed" };
                format!(
                    "run {}  {}  {} added, {} updated, {} failed\n",
                    run_id, outcome, records_added, records_updated, failed
                )
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl BatchProgressReporter for JsonProgress {
    fn report(&self, event: BatchProgressEvent) {
        let obj = event_json(&event);
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

fn event_json(event: &BatchProgressEvent) -> serde_json::Value {
    match event {
        BatchProgressEvent::Started {
            run_id,
            seeded,
            pending,
            resumed,
        } => serde_json::json!({
            "event": "started",
            "run_id": run_id,
            "seeded": seeded,
            "pending": pending,
            "resumed": resumed
        }),
        BatchProgressEvent::Checkpoint {
            run_id,
            query,
            status,
            new_found,
            updated_found,
            done,
            total,
        } => serde_json::json!({
            "event": "checkpoint",
            "run_id": run_id,
            "query": query,
            "status": status.as_str(),
            "new_found": new_found,
            "updated_found": updated_found,
            "n": done,
            "total": total
        }),
        BatchProgressEvent::Finished {
            run_id,
            records_added,
            records_updated,
            failed,
            interrupted,
        } => serde_json::json!({
            "event": "finished",
            "run_id": run_id,
            "records_added": records_added,
            "records_updated": records_updated,
            "failed": failed,
            "interrupted": interrupted
        }),
    }
}

/// One-line summary of a run's checkpoints for `harvest progress`.
pub fn render_progress(run_id: i64, progress: &CheckpointProgress) -> String {
    let pct = if progress.total > 0 {
        progress.completed as f64 * 100.0 / progress.total as f64
    } else {
        0.0
    };
    format!(
        "run {}  {} / {} completed ({:.1}%)  {} failed  {} pending  {} running  {} new  {} updated",
        run_id,
        format_number(progress.completed.max(0) as u64),
        format_number(progress.total.max(0) as u64),
        pct,
        format_number(progress.failed.max(0) as u64),
        format_number(progress.pending.max(0) as u64),
        format_number(progress.in_progress.max(0) as u64),
        format_number(progress.new_found.max(0) as u64),
        format_number(progress.updated_found.max(0) as u64)
    )
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for batch runs: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode, ready to hand to a batch driver.
    pub fn reporter(&self) -> Arc<dyn BatchProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::models::CheckpointStatus;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn checkpoint_event_json_shape() {
        let obj = event_json(&BatchProgressEvent::Checkpoint {
            run_id: 7,
            query: "soy foam".into(),
            status: CheckpointStatus::Failed,
            new_found: 0,
            updated_found: 0,
            done: 3,
            total: 10,
        });
        assert_eq!(obj["event"], "checkpoint");
        assert_eq!(obj["status"], "failed");
        assert_eq!(obj["n"], 3);
        assert_eq!(obj["total"], 10);
    }

    #[test]
    fn render_progress_line() {
        let line = render_progress(
            3,
            &CheckpointProgress {
                total: 2000,
                completed: 1500,
                failed: 10,
                pending: 480,
                in_progress: 10,
                new_found: 12_345,
                updated_found: 6,
            },
        );
        assert!(line.starts_with("run 3  1,500 / 2,000 completed (75.0%)"));
        assert!(line.contains("480 pending  10 running"));
        assert!(line.contains("12,345 new"));
    }
}
