//! Job kinds, queue names and payloads.
//!
//! Every job kind maps to exactly one queue and one handler; see
//! [`crate::worker`] for the dispatch `match`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Named job queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    /// Transcription work
    Voice,

    /// Post-processing (categorization, task creation)
    Processors,

    /// Socket notifications
    Events,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [QueueName::Voice, QueueName::Processors, QueueName::Events];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Processors => "processors",
            Self::Events => "events",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of jobs the workers know how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    Transcribe,
    Categorize,
    CreateTasks,
    SessionEvent,
}

impl JobKind {
    /// Queue this kind of job is delivered through.
    pub fn queue(&self) -> QueueName {
        match self {
            Self::Transcribe => QueueName::Voice,
            Self::Categorize | Self::CreateTasks => QueueName::Processors,
            Self::SessionEvent => QueueName::Events,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcribe => "TRANSCRIBE",
            Self::Categorize => "CATEGORIZE",
            Self::CreateTasks => "CREATE_TASKS",
            Self::SessionEvent => "SESSION_EVENT",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dedup key for per-message jobs: `{session_id}-{message_id}-{KIND}`.
pub fn message_job_key(session_id: &str, message_id: &str, kind: JobKind) -> String {
    format!("{}-{}-{}", session_id, message_id, kind.as_str())
}

/// Dedup key for per-session jobs: `{session_id}-{KIND}`.
pub fn session_job_key(session_id: &str, kind: JobKind) -> String {
    format!("{}-{}", session_id, kind.as_str())
}

/// Payload of a TRANSCRIBE job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscribePayload {
    pub message_id: String,
    pub message_db_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
    pub job_id: String,
}

impl TranscribePayload {
    pub fn dedup_key(&self) -> String {
        message_job_key(&self.session_id, &self.message_id, JobKind::Transcribe)
    }
}

/// Payload of a CATEGORIZE job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorizePayload {
    pub message_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_db_id: Option<String>,
}

impl CategorizePayload {
    pub fn dedup_key(&self) -> String {
        message_job_key(&self.session_id, &self.message_id, JobKind::Categorize)
    }
}

/// Payload of a CREATE_TASKS job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTasksPayload {
    pub session_id: String,
}

impl CreateTasksPayload {
    pub fn dedup_key(&self) -> String {
        session_job_key(&self.session_id, JobKind::CreateTasks)
    }
}

/// Socket event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketEvent {
    MessageUpdate,
    NewMessage,
    SessionUpdate,
}

impl SocketEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageUpdate => "message_update",
            Self::NewMessage => "new_message",
            Self::SessionUpdate => "session_update",
        }
    }
}

/// Payload of a socket notification job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEventPayload {
    pub session_id: String,
    pub event: SocketEvent,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SessionEventPayload {
    pub fn new(session_id: impl Into<String>, event: SocketEvent, payload: serde_json::Value) -> Self {
        Self {
            session_id: session_id.into(),
            event,
            payload,
        }
    }

    /// Dedup key: `{session_id}-{subject}-{event}`, where the subject is the
    /// message id for message events and `session` otherwise.
    pub fn dedup_key(&self) -> String {
        let subject = self
            .payload
            .get("message_id")
            .and_then(|v| v.as_str())
            .unwrap_or("session");
        format!("{}-{}-{}", self.session_id, subject, self.event.as_str())
    }
}
