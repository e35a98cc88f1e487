//! Voice sessions and their log events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::processor::ProcessorState;

/// `error_source` value for session-level transcription blocks.
pub const ERROR_SOURCE_TRANSCRIPTION: &str = "transcription";

/// A voice session: an ordered group of messages that ends up as tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,

    #[serde(default)]
    pub is_active: bool,

    #[serde(default)]
    pub is_deleted: bool,

    /// Advisory: set once every message was seen processed. Never trusted
    /// as a filter.
    #[serde(default)]
    pub is_messages_processed: bool,

    #[serde(default)]
    pub is_waiting: bool,

    #[serde(default)]
    pub is_corrupted: bool,

    #[serde(default)]
    pub is_finalized: bool,

    #[serde(default)]
    pub is_postprocessing: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription_error: Option<String>,

    /// Environment family that owns this record; absent on legacy rows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_tag: Option<String>,

    /// Post-processing steps that must complete before finalization
    #[serde(default)]
    pub session_processors: Vec<String>,

    #[serde(default)]
    pub processors_data: BTreeMap<String, ProcessorState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create an active session stamped with `now`.
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            session_name: None,
            chat_id: None,
            is_active: true,
            is_deleted: false,
            is_messages_processed: false,
            is_waiting: false,
            is_corrupted: false,
            is_finalized: false,
            is_postprocessing: false,
            error_source: None,
            transcription_error: None,
            runtime_tag: None,
            session_processors: Vec::new(),
            processors_data: BTreeMap::new(),
            done_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Declare the post-processing steps with empty state.
    pub fn with_processors<I, S>(mut self, processors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in processors {
            let name = name.into();
            self.processors_data.entry(name.clone()).or_default();
            self.session_processors.push(name);
        }
        self
    }

    /// State of a named processor, if recorded.
    pub fn processor(&self, name: &str) -> Option<&ProcessorState> {
        self.processors_data.get(name)
    }

    /// True when the session is blocked on a transcription quota error.
    pub fn is_transcription_blocked(&self) -> bool {
        self.is_corrupted && self.error_source.as_deref() == Some(ERROR_SOURCE_TRANSCRIPTION)
    }

    /// True when every declared processor reports `is_processed`.
    ///
    /// A session without declared processors is never complete.
    pub fn all_processors_done(&self) -> bool {
        !self.session_processors.is_empty()
            && self
                .session_processors
                .iter()
                .all(|p| self.processor(p).map(|s| s.is_processed).unwrap_or(false))
    }
}

/// A session activity event, used for idle detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLogEvent {
    pub id: String,

    pub session_id: String,

    pub event: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_tag: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl SessionLogEvent {
    pub fn new(session_id: impl Into<String>, event: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            event: event.into(),
            details: None,
            runtime_tag: None,
            created_at: now,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_processors_done() {
        let mut session = Session::new("s1", Utc::now()).with_processors(["categorization", "summary"]);
        assert!(!session.all_processors_done());

        session.processors_data.get_mut("categorization").unwrap().is_processed = true;
        assert!(!session.all_processors_done());

        session.processors_data.get_mut("summary").unwrap().is_processed = true;
        assert!(session.all_processors_done());
    }

    #[test]
    fn test_no_declared_processors_is_not_done() {
        let session = Session::new("s1", Utc::now());
        assert!(!session.all_processors_done());
    }

    #[test]
    fn test_legacy_document_without_flags_parses() {
        let doc = serde_json::json!({
            "id": "legacy",
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
        });
        let session: Session = serde_json::from_value(doc).unwrap();
        assert!(!session.is_active);
        assert!(session.runtime_tag.is_none());
        assert!(session.processors_data.is_empty());
    }
}
