//! Session finalization flow.
//!
//! The terminal transition of a session: verify it can still be closed, run
//! the downstream side effects (task creation, notifications), mark it
//! closed and append a `session_done` log event. Calling it again on a
//! closed session is a successful no-op.
//!
//! Also hosts idle detection for the `close-idle` maintenance command.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::{
    CreateTasksPayload, JobKind, Session, SessionEventPayload, SessionLogEvent, SocketEvent,
};
use crate::queue::{JobQueue, NewJob, QueueError};
use crate::store::{Filter, FindOptions, Repo, SortOrder, StoreError, Update};

/// Log event appended when a session is closed.
pub const SESSION_DONE_EVENT: &str = "session_done";

/// Errors that abort the finalization flow
#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Who asked for the session to be closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneSource {
    Scheduler,
    IdleCloser,
    Manual,
}

/// Parameters of one finalization
#[derive(Debug, Clone)]
pub struct DoneParams {
    pub session_id: String,
    pub source: DoneSource,
    pub now: DateTime<Utc>,
}

impl DoneParams {
    pub fn new(session_id: impl Into<String>, source: DoneSource, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            source,
            now,
        }
    }
}

/// Result of the finalization flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DoneOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub session_id: String,
    /// The session was already closed; nothing was done
    pub already_done: bool,
}

impl DoneOutcome {
    fn done(session_id: &str, already_done: bool) -> Self {
        Self {
            ok: true,
            error: None,
            session_id: session_id.to_string(),
            already_done,
        }
    }

    fn failed(session_id: &str, error: &str) -> Self {
        Self {
            ok: false,
            error: Some(error.to_string()),
            session_id: session_id.to_string(),
            already_done: false,
        }
    }
}

/// Downstream effects of closing a session
#[async_trait]
pub trait DoneSideEffects: Send + Sync {
    async fn on_session_done(&self, session: &Session) -> Result<(), FinalizeError>;
}

/// Default side effects: enqueue CREATE_TASKS and a `session_update` event.
pub struct QueueSideEffects {
    queue: Arc<dyn JobQueue>,
}

impl QueueSideEffects {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl DoneSideEffects for QueueSideEffects {
    async fn on_session_done(&self, session: &Session) -> Result<(), FinalizeError> {
        let tasks = CreateTasksPayload {
            session_id: session.id.clone(),
        };
        self.queue
            .enqueue(NewJob::new(JobKind::CreateTasks, tasks.dedup_key(), &tasks)?)
            .await?;

        let event = SessionEventPayload::new(
            session.id.clone(),
            SocketEvent::SessionUpdate,
            serde_json::json!({ "is_active": false, "is_finalized": session.is_finalized }),
        );
        self.queue
            .enqueue(NewJob::new(JobKind::SessionEvent, event.dedup_key(), &event)?)
            .await?;
        Ok(())
    }
}

/// Close a session. Idempotent.
pub async fn complete_session_done_flow(
    repo: &Repo,
    effects: &dyn DoneSideEffects,
    params: &DoneParams,
) -> Result<DoneOutcome, FinalizeError> {
    let id = params.session_id.as_str();

    let Some(session) = repo.get_session(id).await? else {
        return Ok(DoneOutcome::failed(id, "session_not_found"));
    };
    if session.is_deleted {
        return Ok(DoneOutcome::failed(id, "session_deleted"));
    }
    if session.done_at.is_some() {
        debug!(session_id = %id, "session already done");
        return Ok(DoneOutcome::done(id, true));
    }

    effects.on_session_done(&session).await?;

    let closed = repo
        .update_session(
            id,
            Filter::eq("done_at", Value::Null),
            Update::new()
                .set("is_active", false)
                .set("is_waiting", false)
                .set_time("done_at", params.now)
                .touch(params.now),
        )
        .await?;
    if !closed {
        debug!(session_id = %id, "session closed concurrently");
        return Ok(DoneOutcome::done(id, true));
    }

    let event = SessionLogEvent::new(id, SESSION_DONE_EVENT, params.now)
        .with_details(serde_json::json!({ "source": params.source }));
    repo.insert_log_event(&event).await?;

    info!(session_id = %id, source = ?params.source, "session done");
    Ok(DoneOutcome::done(id, false))
}

/// A session with no recent activity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdleSession {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub idle_hours: f64,
}

/// Restrict idle detection to one session or a bounded batch
#[derive(Debug, Clone, Default)]
pub struct IdleQuery {
    pub session_id: Option<String>,
    pub limit: Option<usize>,
}

/// Latest activity across the session, its messages and its log events.
pub async fn last_activity(repo: &Repo, session: &Session) -> Result<DateTime<Utc>, StoreError> {
    let mut latest = session.updated_at.max(session.created_at);

    let messages = repo
        .find_messages(Filter::eq("session_id", session.id.clone()), FindOptions::default())
        .await?;
    if let Some(ts) = messages.iter().map(|m| m.last_activity()).max() {
        latest = latest.max(ts);
    }

    let events = repo
        .find_log_events(
            Filter::eq("session_id", session.id.clone()),
            FindOptions::default().sort_by("created_at", SortOrder::Desc).limit(1),
        )
        .await?;
    if let Some(event) = events.first() {
        latest = latest.max(event.created_at);
    }

    Ok(latest)
}

/// Open sessions whose last activity is older than `threshold`, oldest first.
pub async fn find_idle_sessions(
    repo: &Repo,
    threshold: Duration,
    now: DateTime<Utc>,
    query: &IdleQuery,
) -> Result<Vec<IdleSession>, StoreError> {
    let mut filter = Filter::and([
        Filter::is_true("is_active"),
        Filter::not_true("is_deleted"),
        Filter::eq("done_at", Value::Null),
    ]);
    if let Some(id) = &query.session_id {
        filter = filter.and_also(Filter::eq("id", id.clone()));
    }

    let mut idle = Vec::new();
    for session in repo.find_sessions(filter, FindOptions::default()).await? {
        let last = last_activity(repo, &session).await?;
        let age = now - last;
        if age >= threshold {
            idle.push(IdleSession {
                session_id: session.id.clone(),
                session_name: session.session_name.clone(),
                last_activity: last,
                idle_hours: age.num_minutes() as f64 / 60.0,
            });
        }
    }

    idle.sort_by_key(|s| s.last_activity);
    if let Some(limit) = query.limit {
        idle.truncate(limit);
    }
    Ok(idle)
}
