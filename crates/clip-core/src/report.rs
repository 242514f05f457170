//! Per-stage run summaries.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::types::{now_millis, Stage};

/// A unit that failed during a run, named so a re-run can be diagnosed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub key: String,
    pub code: String,
    pub message: String,
}

/// Outcome counts for one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Ulid,
    pub stage: Stage,

    /// Units whose result was durably written.
    pub processed: u64,

    /// Units found already complete, or whose write lost to an existing row.
    pub skipped: u64,

    pub failed: Vec<FailedUnit>,

    /// Set when the run stopped before draining its work.
    pub interrupted: bool,

    pub started_at: u64,
    pub finished_at: u64,
}

impl RunReport {
    /// Start an empty report for a stage.
    pub fn begin(stage: Stage) -> Self {
        Self {
            run_id: Ulid::new(),
            stage,
            processed: 0,
            skipped: 0,
            failed: Vec::new(),
            interrupted: false,
            started_at: now_millis(),
            finished_at: 0,
        }
    }

    /// Stamp the finish time.
    pub fn finish(mut self) -> Self {
        self.finished_at = now_millis();
        self
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.len() as u64
    }

    /// Total units the run accounted for.
    pub fn total(&self) -> u64 {
        self.processed + self.skipped + self.failed_count()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.interrupted
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.finished_at.saturating_sub(self.started_at)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<10} processed={} skipped={} failed={} ({}ms){}",
            self.stage.as_str(),
            self.processed,
            self.skipped,
            self.failed.len(),
            self.elapsed_ms(),
            if self.interrupted { " [interrupted]" } else { "" }
        )?;
        for unit in &self.failed {
            write!(f, "\n  ! {} [{}] {}", unit.key, unit.code, unit.message)?;
        }
        Ok(())
    }
}
