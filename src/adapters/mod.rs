//! Adapter interfaces for external providers.
//!
//! Workers only see the traits defined here, so tests can swap the HTTP
//! providers for stubs:
//! - [`Transcriber`]: speech-to-text (OpenAI-compatible API or local whisper)
//! - [`Categorizer`]: transcript categorization (chat completions)
//! - [`telegram::TelegramFiles`]: Bot API file lookup and download

pub mod openai;
pub mod telegram;
pub mod whisper;

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::TranscriptSegment;

pub use openai::OpenAiClient;
pub use telegram::{TelegramClient, TelegramError, TelegramFile, TelegramFiles};
pub use whisper::WhisperTranscriber;

/// Error codes providers use for exhausted quota.
const QUOTA_CODES: &[&str] = &["insufficient_quota", "rate_limit_exceeded", "quota_exceeded"];

/// Errors returned by external providers
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider quota exhausted (HTTP {status}): {message}")]
    Quota {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Provider returned HTTP {status}: {message}")]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Provider request failed: {0}")]
    Transport(String),

    #[error("Provider call timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Build an error from a non-success HTTP response, recognizing quota signals.
    pub fn from_status(status: u16, code: Option<String>, message: String) -> Self {
        if is_quota_signal(status, code.as_deref(), &message) {
            Self::Quota { status, code, message }
        } else {
            Self::Http { status, code, message }
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, Self::Quota { .. })
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Quota { status, .. } | Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Quota { code, .. } | Self::Http { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// True when a provider response signals exhausted quota or rate limiting.
pub fn is_quota_signal(status: u16, code: Option<&str>, message: &str) -> bool {
    if status == 429 {
        return true;
    }
    if code.map(|c| QUOTA_CODES.contains(&c)).unwrap_or(false) {
        return true;
    }
    let message = message.to_ascii_lowercase();
    message.contains("insufficient_quota") || message.contains("exceeded your current quota")
}

/// Output of a transcription provider
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
    pub language: Option<String>,
    pub duration_seconds: Option<f64>,
}

/// Speech-to-text provider
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Server identity recorded in failure context
    fn server_name(&self) -> &str;

    /// Credential in use, if any (only ever logged masked)
    fn credential(&self) -> Option<&str>;

    /// Transcribe a local audio file
    async fn transcribe(&self, audio_path: &Path) -> Result<Transcript, ProviderError>;
}

/// Transcript categorization provider
#[async_trait]
pub trait Categorizer: Send + Sync {
    /// Categorize one transcript into result rows
    async fn categorize(&self, text: &str) -> Result<Vec<Value>, ProviderError>;
}
