//! Voice messages and their transcription/categorization state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::processor::{ProcessorState, CATEGORIZATION};

/// `source_type` for messages ingested from Telegram.
pub const SOURCE_TELEGRAM: &str = "telegram";

/// `file_transport` recorded after the worker downloaded a Telegram file.
pub const TRANSPORT_TELEGRAM_DOWNLOAD: &str = "telegram_download";

/// Diagnostic context written with every classified failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    /// Credential with everything but a short prefix/suffix hidden
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masked_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One timed piece of a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// A single voice message belonging to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Store identity
    pub id: String,

    /// Identity in the source system (e.g. Telegram message id)
    pub message_id: String,

    pub session_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,

    // Transport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_transport: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,

    // Transcription
    #[serde(default)]
    pub is_transcribed: bool,

    #[serde(default)]
    pub to_transcribe: bool,

    #[serde(default)]
    pub transcribe_attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription_retry_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription_next_attempt_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription_error_context: Option<ErrorContext>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription_text: Option<String>,

    #[serde(default)]
    pub transcription_segments: Vec<TranscriptSegment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcribed_at: Option<DateTime<Utc>>,

    // Categorization
    #[serde(default)]
    pub processors_data: BTreeMap<String, ProcessorState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categorization_retry_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categorization_next_attempt_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub categorization_attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categorization_error: Option<String>,

    #[serde(default)]
    pub categorization: Vec<serde_json::Value>,

    // Bookkeeping
    #[serde(default)]
    pub is_deleted: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_tag: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Create an untranscribed message queued for transcription.
    pub fn new(
        id: impl Into<String>,
        message_id: impl Into<String>,
        session_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut processors_data = BTreeMap::new();
        processors_data.insert(CATEGORIZATION.to_string(), ProcessorState::default());

        Self {
            id: id.into(),
            message_id: message_id.into(),
            session_id: session_id.into(),
            chat_id: None,
            source_type: None,
            file_path: None,
            file_id: None,
            file_transport: None,
            mime_type: None,
            file_name: None,
            file_size: None,
            file_hash: None,
            is_transcribed: false,
            to_transcribe: true,
            transcribe_attempts: 0,
            transcription_error: None,
            transcription_retry_reason: None,
            transcription_next_attempt_at: None,
            transcription_error_context: None,
            transcription_text: None,
            transcription_segments: Vec::new(),
            transcribed_at: None,
            processors_data,
            categorization_retry_reason: None,
            categorization_next_attempt_at: None,
            categorization_attempts: 0,
            categorization_error: None,
            categorization: Vec::new(),
            is_deleted: false,
            duplicate_of: None,
            runtime_tag: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Categorization sub-state (empty default when never recorded).
    pub fn categorization_state(&self) -> ProcessorState {
        self.processors_data
            .get(CATEGORIZATION)
            .cloned()
            .unwrap_or_default()
    }

    /// True when the message came from Telegram.
    pub fn is_telegram(&self) -> bool {
        self.source_type.as_deref() == Some(SOURCE_TELEGRAM)
    }

    /// True when the message is a WebM recording.
    pub fn is_webm(&self) -> bool {
        let by_mime = self
            .mime_type
            .as_deref()
            .map(|m| m.eq_ignore_ascii_case("audio/webm") || m.eq_ignore_ascii_case("video/webm"))
            .unwrap_or(false);
        let by_name = self
            .file_name
            .as_deref()
            .or(self.file_path.as_deref())
            .map(|n| n.to_ascii_lowercase().ends_with(".webm"))
            .unwrap_or(false);
        by_mime || by_name
    }

    /// Most recent write time known for this message.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.updated_at.max(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_wants_transcription() {
        let msg = Message::new("m1", "100", "s1", Utc::now());
        assert!(msg.to_transcribe);
        assert!(!msg.is_transcribed);
        assert_eq!(msg.categorization_state(), ProcessorState::default());
    }

    #[test]
    fn test_webm_detection() {
        let mut msg = Message::new("m1", "100", "s1", Utc::now());
        assert!(!msg.is_webm());

        msg.file_name = Some("chunk-01.WEBM".to_string());
        assert!(msg.is_webm());

        msg.file_name = None;
        msg.mime_type = Some("audio/webm".to_string());
        assert!(msg.is_webm());
    }

    #[test]
    fn test_error_context_omits_empty_fields() {
        let ctx = ErrorContext {
            error_code: Some("insufficient_quota".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json, serde_json::json!({ "error_code": "insufficient_quota" }));
    }
}
