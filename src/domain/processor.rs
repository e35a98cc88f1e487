//! Per-processor sub-state shared by sessions and messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the categorization processor in `processors_data`.
pub const CATEGORIZATION: &str = "categorization";

/// Name of the task-creation processor in `processors_data`.
pub const CREATE_TASKS: &str = "create_tasks";

/// State of one post-processing step.
///
/// `is_processing` together with `job_queued_timestamp` is a soft lock: a
/// worker sets both when it claims the step, and the reconciliation
/// scheduler clears them once the lock outlives the staleness threshold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorState {
    #[serde(default)]
    pub is_processing: bool,

    #[serde(default)]
    pub is_processed: bool,

    #[serde(default)]
    pub is_finished: bool,

    /// When the current lock was acquired
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_queued_timestamp: Option<DateTime<Utc>>,
}

impl ProcessorState {
    /// True when a worker holds the lock and has not finished the step.
    pub fn is_locked(&self) -> bool {
        self.is_processing && !self.is_finished
    }

    /// True when the lock was taken before `cutoff` and never released.
    ///
    /// A lock without a timestamp counts as stale: nothing else can ever
    /// release it.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        if !self.is_locked() {
            return false;
        }
        match self.job_queued_timestamp {
            Some(ts) => ts < cutoff,
            None => true,
        }
    }
}
