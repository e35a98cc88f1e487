//! Job queue client.
//!
//! Jobs are enqueued with a dedup key: while a job with the same key is
//! waiting or active, a second enqueue is coalesced into it. The queue is a
//! delivery accelerator only; the reconciliation scheduler rediscovers any
//! lost work from the store.

pub mod jsonl;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{JobKind, QueueName};

pub use jsonl::JsonlJobQueue;

/// Errors that can occur with the job queue
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: {from:?} → {to:?}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Queue task failed: {0}")]
    Task(String),
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    /// Waiting or active jobs hold their dedup key.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Waiting | Self::Active)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A job to be enqueued
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub kind: JobKind,
    pub dedup_key: String,
    pub payload: serde_json::Value,
}

impl NewJob {
    pub fn new<T: Serialize>(
        kind: JobKind,
        dedup_key: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind,
            dedup_key: dedup_key.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn queue(&self) -> QueueName {
        self.kind.queue()
    }
}

/// A job with current state (derived from replaying the queue log)
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub dedup_key: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Number of times a worker claimed this job
    pub attempts: u32,
    /// Position of the enqueue in the queue log
    pub sequence: u64,
}

impl Job {
    /// Decode the payload into its typed form.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Result of enqueueing a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Queued as a new job
    Queued(String),

    /// Coalesced into an in-flight job with the same dedup key
    AlreadyQueued(String),
}

impl EnqueueResult {
    /// Get the job ID regardless of result type
    pub fn id(&self) -> &str {
        match self {
            Self::Queued(id) | Self::AlreadyQueued(id) => id,
        }
    }

    /// Check if this was a new enqueue
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Queued(_))
    }
}

/// Queue status summary
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStatus {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStatus {
    /// Total jobs in queue
    pub fn total(&self) -> usize {
        self.waiting + self.active + self.completed + self.failed
    }
}

/// Named job queues with dedup-key enqueue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job, coalescing with an in-flight job of the same key.
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueResult, QueueError>;

    /// Claim the oldest waiting job of a queue.
    async fn claim_next(&self, queue: QueueName) -> Result<Option<Job>, QueueError>;

    /// Mark an active job completed.
    async fn complete(&self, queue: QueueName, job_id: &str) -> Result<(), QueueError>;

    /// Mark an active job failed.
    async fn fail(&self, queue: QueueName, job_id: &str, error: &str) -> Result<(), QueueError>;

    /// All jobs of a queue, oldest first.
    async fn jobs(&self, queue: QueueName) -> Result<Vec<Job>, QueueError>;

    /// Counts per state.
    async fn status(&self, queue: QueueName) -> Result<QueueStatus, QueueError> {
        let mut status = QueueStatus::default();
        for job in self.jobs(queue).await? {
            match job.state {
                JobState::Waiting => status.waiting += 1,
                JobState::Active => status.active += 1,
                JobState::Completed => status.completed += 1,
                JobState::Failed => status.failed += 1,
            }
        }
        Ok(status)
    }
}
