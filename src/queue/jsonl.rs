//! JSONL-based job queue.
//!
//! Append-only JSONL per queue with state derived from replay. Each
//! state change is appended as a new line. An exclusive advisory lock on a
//! sidecar `.lock` file spans every read-check-append, so several worker
//! processes can share one queue directory without double-enqueueing.
//!
//! Once a log grows past a size threshold, enqueue rewrites it without the
//! jobs that finished longer ago than the retention window.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{EnqueueResult, Job, JobQueue, JobState, NewJob, QueueError};
use crate::domain::QueueName;

/// An event in the queue log (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    /// When this event occurred
    pub timestamp: DateTime<Utc>,

    pub job_id: String,

    pub event_type: QueueEventType,

    /// Additional data (depends on event type)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Types of queue events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventType {
    /// Job added to queue
    Enqueued,

    /// A worker claimed the job
    Started,

    /// Job finished successfully
    Completed,

    /// Job failed (or its lease expired)
    Failed,
}

/// Default time an active job may hold its dedup key before it is
/// considered abandoned by a crashed worker.
const DEFAULT_LEASE_MINUTES: i64 = 30;

/// Finished jobs stay visible for this long after they finish.
const DEFAULT_RETENTION_HOURS: i64 = 24;

/// Log size that triggers compaction on enqueue.
const DEFAULT_COMPACT_AFTER_BYTES: u64 = 1024 * 1024;

/// Directory of JSONL queue logs, one file per queue
pub struct JsonlJobQueue {
    dir: PathBuf,
    lease: Duration,
    retention: Duration,
    compact_after_bytes: u64,
}

impl JsonlJobQueue {
    /// Create a queue set rooted at `dir`
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            lease: Duration::minutes(DEFAULT_LEASE_MINUTES),
            retention: Duration::hours(DEFAULT_RETENTION_HOURS),
            compact_after_bytes: DEFAULT_COMPACT_AFTER_BYTES,
        }
    }

    /// Override how long an active job keeps its lease
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Keep finished jobs for `retention`; compact logs larger than `compact_after_bytes`
    pub fn with_retention(mut self, retention: Duration, compact_after_bytes: u64) -> Self {
        self.retention = retention;
        self.compact_after_bytes = compact_after_bytes;
        self
    }

    /// Rewrite a queue log without expired finished jobs; returns how many were dropped
    pub async fn compact(&self, queue: QueueName) -> Result<usize, QueueError> {
        self.locked(queue, |log| log.compact(Utc::now())).await
    }

    pub fn log_path(&self, queue: QueueName) -> PathBuf {
        self.dir.join(format!("{}.jsonl", queue.as_str()))
    }

    fn lock_path(&self, queue: QueueName) -> PathBuf {
        self.dir.join(format!("{}.lock", queue.as_str()))
    }

    /// Run `f` against the queue log while holding the queue's file lock
    async fn locked<T, F>(&self, queue: QueueName, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&QueueLog) -> Result<T, QueueError> + Send + 'static,
    {
        let log = QueueLog {
            path: self.log_path(queue),
            lease: self.lease,
            retention: self.retention,
            compact_after_bytes: self.compact_after_bytes,
        };
        let lock_path = self.lock_path(queue);
        let dir = self.dir.clone();

        tokio::task::spawn_blocking(move || {
            fs::create_dir_all(&dir)?;
            let lock = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            lock.lock_exclusive()?;
            let result = f(&log);
            // Dropping the handle releases the lock as well
            let _ = lock.unlock();
            result
        })
        .await
        .map_err(|e| QueueError::Task(e.to_string()))?
    }
}

/// One queue's log file; only touched while its lock is held
struct QueueLog {
    path: PathBuf,
    lease: Duration,
    retention: Duration,
    compact_after_bytes: u64,
}

impl QueueLog {
    /// Append an event to the queue log
    fn append_event(&self, event: &QueueEvent) -> Result<(), QueueError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let json = serde_json::to_string(event)?;
        file.write_all(format!("{}\n", json).as_bytes())?;
        file.flush()?;

        Ok(())
    }

    fn append(
        &self,
        job_id: &str,
        event_type: QueueEventType,
        data: Option<serde_json::Value>,
    ) -> Result<(), QueueError> {
        self.append_event(&QueueEvent {
            timestamp: Utc::now(),
            job_id: job_id.to_string(),
            event_type,
            data,
        })
    }

    /// Replay all events to build current state
    fn replay(&self) -> Result<HashMap<String, Job>, QueueError> {
        let mut jobs: HashMap<String, Job> = HashMap::new();

        if !self.path.exists() {
            return Ok(jobs);
        }

        let reader = BufReader::new(File::open(&self.path)?);
        for (seq, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            // A torn trailing line from a crashed writer is skipped, not fatal
            match serde_json::from_str::<QueueEvent>(&line) {
                Ok(event) => apply_event(&mut jobs, event, seq as u64),
                Err(e) => warn!(path = %self.path.display(), error = %e, "skipping bad queue line"),
            }
        }

        Ok(jobs)
    }

    /// Jobs sorted oldest first
    fn sorted(&self) -> Result<Vec<Job>, QueueError> {
        let mut jobs: Vec<Job> = self.replay()?.into_values().collect();
        jobs.sort_by_key(|j| j.sequence);
        Ok(jobs)
    }

    /// Compact when the log has outgrown its threshold
    fn compact_if_large(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        if size < self.compact_after_bytes {
            return Ok(0);
        }
        self.compact(now)
    }

    /// Rewrite the log keeping in-flight jobs and recently finished ones
    fn compact(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let jobs = self.sorted()?;
        let total = jobs.len();
        let kept: Vec<&Job> = jobs
            .iter()
            .filter(|j| {
                j.state.is_in_flight()
                    || j.finished_at.map(|at| at + self.retention > now).unwrap_or(true)
            })
            .collect();
        let dropped = total - kept.len();
        if dropped == 0 {
            return Ok(0);
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        let mut out = BufWriter::new(File::create(&tmp)?);
        for job in &kept {
            for event in replay_events(job)? {
                writeln!(out, "{}", serde_json::to_string(&event)?)?;
            }
        }
        out.flush()?;
        drop(out);
        fs::rename(&tmp, &self.path)?;

        info!(path = %self.path.display(), dropped, kept = kept.len(), "compacted queue log");
        Ok(dropped)
    }

    /// Fail active jobs whose lease ran out; returns the live job set
    fn expire_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        let mut jobs = self.sorted()?;
        for job in jobs.iter_mut() {
            if job.state != JobState::Active {
                continue;
            }
            let expired = job
                .started_at
                .map(|started| started + self.lease <= now)
                .unwrap_or(true);
            if expired {
                warn!(job_id = %job.id, dedup_key = %job.dedup_key, "active job lease expired");
                self.append(
                    &job.id,
                    QueueEventType::Failed,
                    Some(serde_json::json!({ "error": "lease expired" })),
                )?;
                job.state = JobState::Failed;
                job.error = Some("lease expired".to_string());
            }
        }
        Ok(jobs)
    }
}

/// Events that rebuild `job` exactly when replayed
fn replay_events(job: &Job) -> Result<Vec<QueueEvent>, serde_json::Error> {
    let new_job = NewJob {
        kind: job.kind,
        dedup_key: job.dedup_key.clone(),
        payload: job.payload.clone(),
    };
    let mut events = vec![QueueEvent {
        timestamp: job.enqueued_at,
        job_id: job.id.clone(),
        event_type: QueueEventType::Enqueued,
        data: Some(serde_json::to_value(&new_job)?),
    }];

    let started_at = job.started_at.unwrap_or(job.enqueued_at);
    for _ in 0..job.attempts {
        events.push(QueueEvent {
            timestamp: started_at,
            job_id: job.id.clone(),
            event_type: QueueEventType::Started,
            data: None,
        });
    }

    let finished_at = job.finished_at.unwrap_or(started_at);
    match job.state {
        JobState::Waiting | JobState::Active => {}
        JobState::Completed => events.push(QueueEvent {
            timestamp: finished_at,
            job_id: job.id.clone(),
            event_type: QueueEventType::Completed,
            data: None,
        }),
        JobState::Failed => events.push(QueueEvent {
            timestamp: finished_at,
            job_id: job.id.clone(),
            event_type: QueueEventType::Failed,
            data: job.error.as_ref().map(|e| serde_json::json!({ "error": e })),
        }),
    }
    Ok(events)
}

/// Apply a single event to the state
fn apply_event(jobs: &mut HashMap<String, Job>, event: QueueEvent, seq: u64) {
    match event.event_type {
        QueueEventType::Enqueued => {
            if let Some(data) = event.data {
                if let Ok(new_job) = serde_json::from_value::<NewJob>(data) {
                    jobs.insert(
                        event.job_id.clone(),
                        Job {
                            id: event.job_id,
                            kind: new_job.kind,
                            dedup_key: new_job.dedup_key,
                            payload: new_job.payload,
                            state: JobState::Waiting,
                            enqueued_at: event.timestamp,
                            started_at: None,
                            finished_at: None,
                            error: None,
                            attempts: 0,
                            sequence: seq,
                        },
                    );
                }
            }
        }
        QueueEventType::Started => {
            if let Some(job) = jobs.get_mut(&event.job_id) {
                job.state = JobState::Active;
                job.started_at = Some(event.timestamp);
                job.attempts += 1;
            }
        }
        QueueEventType::Completed => {
            if let Some(job) = jobs.get_mut(&event.job_id) {
                job.state = JobState::Completed;
                job.finished_at = Some(event.timestamp);
            }
        }
        QueueEventType::Failed => {
            if let Some(job) = jobs.get_mut(&event.job_id) {
                job.state = JobState::Failed;
                job.finished_at = Some(event.timestamp);
                if let Some(error) = event
                    .data
                    .as_ref()
                    .and_then(|d| d.get("error"))
                    .and_then(|e| e.as_str())
                {
                    job.error = Some(error.to_string());
                }
            }
        }
    }
}

fn finish(log: &QueueLog, job_id: &str, event_type: QueueEventType, data: Option<serde_json::Value>) -> Result<(), QueueError> {
    let jobs = log.replay()?;
    let job = jobs
        .get(job_id)
        .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

    if job.state != JobState::Active {
        let to = match event_type {
            QueueEventType::Completed => JobState::Completed,
            _ => JobState::Failed,
        };
        return Err(QueueError::InvalidTransition { from: job.state, to });
    }

    log.append(job_id, event_type, data)
}

#[async_trait]
impl JobQueue for JsonlJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueResult, QueueError> {
        let queue = job.queue();
        self.locked(queue, move |log| {
            let now = Utc::now();
            log.compact_if_large(now)?;
            let jobs = log.expire_leases(now)?;
            if let Some(existing) = jobs
                .iter()
                .find(|j| j.dedup_key == job.dedup_key && j.state.is_in_flight())
            {
                return Ok(EnqueueResult::AlreadyQueued(existing.id.clone()));
            }

            let id = uuid::Uuid::new_v4().to_string();
            log.append(&id, QueueEventType::Enqueued, Some(serde_json::to_value(&job)?))?;
            Ok(EnqueueResult::Queued(id))
        })
        .await
    }

    async fn claim_next(&self, queue: QueueName) -> Result<Option<Job>, QueueError> {
        self.locked(queue, move |log| {
            let jobs = log.expire_leases(Utc::now())?;
            let Some(mut job) = jobs.into_iter().find(|j| j.state == JobState::Waiting) else {
                return Ok(None);
            };

            log.append(&job.id, QueueEventType::Started, None)?;
            job.state = JobState::Active;
            job.started_at = Some(Utc::now());
            job.attempts += 1;
            Ok(Some(job))
        })
        .await
    }

    async fn complete(&self, queue: QueueName, job_id: &str) -> Result<(), QueueError> {
        let job_id = job_id.to_string();
        self.locked(queue, move |log| {
            finish(log, &job_id, QueueEventType::Completed, None)
        })
        .await
    }

    async fn fail(&self, queue: QueueName, job_id: &str, error: &str) -> Result<(), QueueError> {
        let job_id = job_id.to_string();
        let data = serde_json::json!({ "error": error });
        self.locked(queue, move |log| {
            finish(log, &job_id, QueueEventType::Failed, Some(data))
        })
        .await
    }

    async fn jobs(&self, queue: QueueName) -> Result<Vec<Job>, QueueError> {
        self.locked(queue, |log| log.sorted()).await
    }
}
