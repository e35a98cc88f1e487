//! Job dispatch.
//!
//! Workers claim jobs from a queue and route them by [`JobKind`] through one
//! exhaustive `match`. A job whose handler reports a classified failure is
//! marked failed; the store already records why, and the reconciliation
//! scheduler decides whether it runs again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::categorization::{CategorizationError, CategorizationWorker};
use crate::domain::{
    CategorizePayload, CreateTasksPayload, JobKind, QueueName, SessionEventPayload, SessionLogEvent,
    TranscribePayload, CREATE_TASKS,
};
use crate::queue::{Job, JobQueue, QueueError};
use crate::store::{Filter, Repo, StoreError, Update};
use crate::transcription::{TranscriptionError, TranscriptionWorker};

/// Log event appended when task creation was handed downstream.
pub const TASKS_REQUESTED_EVENT: &str = "tasks_requested";

/// Errors from running one job
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Handler ran and classified a failure
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Transcription(#[from] TranscriptionError),

    #[error(transparent)]
    Categorization(#[from] CategorizationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Delivery of socket notifications
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &SessionEventPayload) -> Result<(), WorkerError>;
}

/// Event sink that only logs; used when no socket server is attached.
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn publish(&self, event: &SessionEventPayload) -> Result<(), WorkerError> {
        info!(session_id = %event.session_id, event = event.event.as_str(), payload = %event.payload, "session event");
        Ok(())
    }
}

/// Handlers for every job kind
pub struct Handlers {
    pub repo: Repo,
    pub transcription: TranscriptionWorker,
    pub categorization: CategorizationWorker,
    pub events: Arc<dyn EventSink>,
}

/// Result of processing one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRun {
    pub job_id: String,
    pub kind: JobKind,
    pub error: Option<String>,
}

/// Claims and runs jobs
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    handlers: Handlers,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(queue: Arc<dyn JobQueue>, handlers: Handlers, poll_interval: Duration) -> Self {
        Self {
            queue,
            handlers,
            poll_interval,
        }
    }

    /// Claim and run the oldest waiting job of `queue`, if any.
    pub async fn process_next(&self, queue: QueueName) -> Result<Option<JobRun>, QueueError> {
        let Some(job) = self.queue.claim_next(queue).await? else {
            return Ok(None);
        };

        debug!(job_id = %job.id, kind = %job.kind, key = %job.dedup_key, "running job");
        let error = match self.dispatch(&job).await {
            Ok(()) => {
                self.queue.complete(queue, &job.id).await?;
                None
            }
            Err(e) => {
                if matches!(e, WorkerError::Failed(_)) {
                    warn!(job_id = %job.id, kind = %job.kind, error = %e, "job failed");
                } else {
                    error!(job_id = %job.id, kind = %job.kind, error = %e, "job errored");
                }
                let message = e.to_string();
                self.queue.fail(queue, &job.id, &message).await?;
                Some(message)
            }
        };

        Ok(Some(JobRun {
            job_id: job.id,
            kind: job.kind,
            error,
        }))
    }

    async fn dispatch(&self, job: &Job) -> Result<(), WorkerError> {
        match job.kind {
            JobKind::Transcribe => {
                let payload: TranscribePayload = job.payload()?;
                let outcome = self.handlers.transcription.handle_transcribe_job(&payload).await?;
                outcome_result(outcome.ok, outcome.error)
            }
            JobKind::Categorize => {
                let payload: CategorizePayload = job.payload()?;
                let outcome = self.handlers.categorization.handle_categorize_job(&payload).await?;
                outcome_result(outcome.ok, outcome.error)
            }
            JobKind::CreateTasks => {
                let payload: CreateTasksPayload = job.payload()?;
                self.create_tasks(&payload).await
            }
            JobKind::SessionEvent => {
                let payload: SessionEventPayload = job.payload()?;
                self.handlers.events.publish(&payload).await
            }
        }
    }

    /// Record the task-creation handoff on the session.
    async fn create_tasks(&self, payload: &CreateTasksPayload) -> Result<(), WorkerError> {
        let now = Utc::now();
        let path = format!("processors_data.{CREATE_TASKS}");
        let updated = self
            .handlers
            .repo
            .update_session(
                &payload.session_id,
                Filter::not_true(format!("{path}.is_processed")),
                Update::new()
                    .set(format!("{path}.is_processed"), true)
                    .set(format!("{path}.is_finished"), true)
                    .set(format!("{path}.is_processing"), false)
                    .set("is_postprocessing", false)
                    .touch(now),
            )
            .await?;

        if updated {
            let event = SessionLogEvent::new(payload.session_id.clone(), TASKS_REQUESTED_EVENT, now);
            self.handlers.repo.insert_log_event(&event).await?;
            info!(session_id = %payload.session_id, "task creation requested");
        }
        Ok(())
    }

    /// Poll `queue` with `concurrency` loops until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, queue: QueueName, concurrency: usize, shutdown: watch::Receiver<bool>) {
        let mut loops = Vec::with_capacity(concurrency);
        for slot in 0..concurrency.max(1) {
            let worker = Arc::clone(&self);
            let mut shutdown = shutdown.clone();
            loops.push(tokio::spawn(async move {
                info!(queue = %queue, slot, "worker started");
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    let idle = match worker.process_next(queue).await {
                        Ok(Some(_)) => false,
                        Ok(None) => true,
                        Err(e) => {
                            error!(queue = %queue, error = %e, "queue error");
                            true
                        }
                    };
                    if idle {
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = tokio::time::sleep(worker.poll_interval) => {}
                        }
                    }
                }
                info!(queue = %queue, slot, "worker stopped");
            }));
        }

        for handle in loops {
            if let Err(e) = handle.await {
                error!(queue = %queue, error = %e, "worker task panicked");
            }
        }
    }
}

fn outcome_result(ok: bool, error: Option<String>) -> Result<(), WorkerError> {
    if ok {
        Ok(())
    } else {
        Err(WorkerError::Failed(error.unwrap_or_else(|| "failed".to_string())))
    }
}
