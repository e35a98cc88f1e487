//! Transcription failure taxonomy and retry policy.
//!
//! Every failure is classified into a closed [`TranscriptionFailure`]; the
//! retry policy is decided by one exhaustive match in
//! [`TranscriptionFailure::retry_policy`]. The resulting store update is all
//! the reconciliation scheduler needs to decide what to requeue.

use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::adapters::ProviderError;
use crate::domain::ErrorContext;
use crate::store::Update;

/// Retry reason for quota failures (exempt from the attempt ceiling).
pub const RETRY_REASON_QUOTA: &str = "insufficient_quota";

/// Retry reason for generic transient failures.
pub const RETRY_REASON_TRANSIENT: &str = "transient_error";

/// Classified transcription failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptionFailure {
    /// Provider signalled exhausted quota or rate limiting
    QuotaExceeded,
    /// The resolved audio path does not exist
    FileNotFound,
    /// No local file and no way to fetch one
    MissingTransport,
    /// Any other provider or transport error
    Transient,
}

impl TranscriptionFailure {
    /// Value written to `transcription_error`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::QuotaExceeded => "insufficient_quota",
            Self::FileNotFound => "file_not_found",
            Self::MissingTransport => "missing_transport",
            Self::Transient => "transcription_failed",
        }
    }

    /// Classify a provider error.
    pub fn from_provider(err: &ProviderError) -> Self {
        if err.is_quota() {
            Self::QuotaExceeded
        } else {
            Self::Transient
        }
    }

    /// Decide what happens next, given the attempt count including this one.
    pub fn retry_policy(&self, settings: &RetrySettings, attempts: u32) -> RetryPolicy {
        match self {
            Self::QuotaExceeded => RetryPolicy::Retry {
                reason: RETRY_REASON_QUOTA,
                delay: settings.quota_backoff,
            },
            Self::Transient if attempts >= settings.max_attempts => RetryPolicy::Exhausted {
                reason: RETRY_REASON_TRANSIENT,
            },
            Self::Transient => RetryPolicy::Retry {
                reason: RETRY_REASON_TRANSIENT,
                delay: settings.transient_backoff(attempts),
            },
            Self::FileNotFound | Self::MissingTransport => RetryPolicy::Fatal,
        }
    }

    /// Store update recording this failure on the message.
    pub fn message_update(
        &self,
        settings: &RetrySettings,
        attempts: u32,
        context: &ErrorContext,
        now: DateTime<Utc>,
    ) -> Result<Update, serde_json::Error> {
        let update = Update::new()
            .set("transcription_error", self.code())
            .set_json("transcription_error_context", context)?
            .set("transcribe_attempts", attempts)
            .touch(now);

        let update = match self.retry_policy(settings, attempts) {
            RetryPolicy::Retry { reason, delay } => update
                .set("transcription_retry_reason", reason)
                .set_time("transcription_next_attempt_at", now + delay)
                // Quota retries are re-enabled by the scheduler's unblock sweep
                .set("to_transcribe", !matches!(self, Self::QuotaExceeded)),
            RetryPolicy::Exhausted { reason } => update
                .set("to_transcribe", false)
                .set("transcription_retry_reason", reason)
                .unset("transcription_next_attempt_at"),
            RetryPolicy::Fatal => update
                .set("to_transcribe", false)
                .unset("transcription_retry_reason")
                .unset("transcription_next_attempt_at"),
        };
        Ok(update)
    }
}

impl fmt::Display for TranscriptionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// What the store should do with a failed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Schedule another attempt after `delay`
    Retry { reason: &'static str, delay: Duration },
    /// Attempt ceiling reached; the reason stays for operators
    Exhausted { reason: &'static str },
    /// Never retry automatically
    Fatal,
}

/// Backoff and ceiling parameters
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Attempt ceiling for non-quota failures
    pub max_attempts: u32,
    pub quota_backoff: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            quota_backoff: Duration::minutes(10),
            retry_base: Duration::seconds(60),
            retry_max: Duration::minutes(30),
        }
    }
}

impl RetrySettings {
    pub fn from_config(config: &crate::config::TranscriptionSettings) -> Self {
        Self {
            max_attempts: config.max_attempts,
            quota_backoff: Duration::minutes(config.quota_backoff_minutes),
            retry_base: Duration::seconds(config.retry_base_seconds),
            retry_max: Duration::seconds(config.retry_max_seconds),
        }
    }

    /// Exponential backoff: base, 2x base, 4x base ... capped at `retry_max`.
    pub fn transient_backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.retry_base
            .checked_mul(2i32.pow(exponent))
            .unwrap_or(self.retry_max)
            .min(self.retry_max)
    }
}

/// Mask a secret value for display: `sk-p...wxyz`.
///
/// Shows prefix (up to 4 chars) and suffix (up to 4 chars) with "..." in
/// between. Short values (< 10 chars) are fully masked as "****".
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() < 10 {
        return "****".to_string();
    }
    let prefix: String = chars[..4].iter().collect();
    let suffix: String = chars[chars.len() - 4..].iter().collect();
    format!("{prefix}...{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_codes() {
        assert_eq!(TranscriptionFailure::QuotaExceeded.code(), "insufficient_quota");
        assert_eq!(TranscriptionFailure::FileNotFound.code(), "file_not_found");
        assert_eq!(TranscriptionFailure::MissingTransport.code(), "missing_transport");
        assert_eq!(TranscriptionFailure::Transient.to_string(), "transcription_failed");
    }

    #[test]
    fn test_transient_backoff_is_exponential_and_capped() {
        let settings = RetrySettings::default();
        assert_eq!(settings.transient_backoff(1), Duration::seconds(60));
        assert_eq!(settings.transient_backoff(2), Duration::seconds(120));
        assert_eq!(settings.transient_backoff(3), Duration::seconds(240));
        assert_eq!(settings.transient_backoff(40), Duration::minutes(30));
    }

    #[test]
    fn test_fatal_update_stops_retries() {
        let now = Utc::now();
        let mut doc = json!({
            "to_transcribe": true,
            "transcription_retry_reason": "transient_error",
            "transcription_next_attempt_at": "2024-01-01T00:00:00Z"
        });
        let ctx = ErrorContext {
            file_path: Some("/missing.ogg".to_string()),
            ..Default::default()
        };

        TranscriptionFailure::FileNotFound
            .message_update(&RetrySettings::default(), 1, &ctx, now)
            .unwrap()
            .apply(&mut doc);

        assert_eq!(doc["to_transcribe"], false);
        assert_eq!(doc["transcription_error"], "file_not_found");
        assert_eq!(doc["transcription_error_context"]["file_path"], "/missing.ogg");
        assert!(doc.get("transcription_retry_reason").is_none());
        assert!(doc.get("transcription_next_attempt_at").is_none());
    }

    #[test]
    fn test_quota_update_schedules_retry_and_parks_message() {
        let now = Utc::now();
        let mut doc = json!({ "to_transcribe": true });

        TranscriptionFailure::QuotaExceeded
            .message_update(&RetrySettings::default(), 6, &ErrorContext::default(), now)
            .unwrap()
            .apply(&mut doc);

        assert_eq!(doc["to_transcribe"], false);
        assert_eq!(doc["transcribe_attempts"], 6);
        assert_eq!(doc["transcription_retry_reason"], RETRY_REASON_QUOTA);
        let next: DateTime<Utc> =
            serde_json::from_value(doc["transcription_next_attempt_at"].clone()).unwrap();
        assert_eq!(next, now + Duration::minutes(10));
    }

    #[test]
    fn test_transient_update_keeps_message_queued() {
        let mut doc = json!({ "to_transcribe": true });
        TranscriptionFailure::Transient
            .message_update(&RetrySettings::default(), 1, &ErrorContext::default(), Utc::now())
            .unwrap()
            .apply(&mut doc);

        assert_eq!(doc["to_transcribe"], true);
        assert_eq!(doc["transcription_retry_reason"], RETRY_REASON_TRANSIENT);
    }

    #[test]
    fn test_transient_update_at_ceiling_is_terminal() {
        let now = Utc::now();
        let settings = RetrySettings::default();
        assert_eq!(
            TranscriptionFailure::Transient.retry_policy(&settings, settings.max_attempts),
            RetryPolicy::Exhausted {
                reason: RETRY_REASON_TRANSIENT
            }
        );

        let mut doc = json!({
            "to_transcribe": true,
            "transcription_next_attempt_at": "2024-01-01T00:00:00Z"
        });
        TranscriptionFailure::Transient
            .message_update(&settings, settings.max_attempts, &ErrorContext::default(), now)
            .unwrap()
            .apply(&mut doc);

        assert_eq!(doc["to_transcribe"], false);
        assert_eq!(doc["transcribe_attempts"], 3);
        assert_eq!(doc["transcription_error"], "transcription_failed");
        assert_eq!(doc["transcription_retry_reason"], RETRY_REASON_TRANSIENT);
        assert!(doc.get("transcription_next_attempt_at").is_none());

        // Quota failures ignore the ceiling
        assert!(matches!(
            TranscriptionFailure::QuotaExceeded.retry_policy(&settings, 10),
            RetryPolicy::Retry { .. }
        ));
    }

    #[test]
    fn mask_secret_long_value() {
        assert_eq!(mask_secret("sk-proj-abcdefghijwxyz"), "sk-p...wxyz");
    }

    #[test]
    fn mask_secret_short_value() {
        assert_eq!(mask_secret("sk-short"), "****");
    }
}
