//! Eligibility predicates for the reconciliation sweeps.
//!
//! Pure functions over decoded records. The sweeps narrow candidates with a
//! coarse store filter and decide with these.

use chrono::{DateTime, Utc};

use crate::domain::{Message, Session, ERROR_SOURCE_TRANSCRIPTION};
use crate::transcription::failure::RETRY_REASON_QUOTA;

/// `transcription_error` of a session blocked on provider quota.
pub const QUOTA_ERROR: &str = "insufficient_quota";

fn is_due(next_attempt_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    next_attempt_at.map(|at| at <= now).unwrap_or(true)
}

/// Session blocked by a transcription quota failure.
pub fn is_quota_blocked(session: &Session) -> bool {
    session.is_corrupted
        && session.error_source.as_deref() == Some(ERROR_SOURCE_TRANSCRIPTION)
        && session.transcription_error.as_deref() == Some(QUOTA_ERROR)
}

/// Untranscribed message parked by a quota failure.
pub fn is_quota_parked(message: &Message) -> bool {
    !message.is_deleted
        && !message.is_transcribed
        && message.transcription_retry_reason.as_deref() == Some(RETRY_REASON_QUOTA)
}

/// Quota-parked message whose backoff has elapsed.
pub fn quota_retry_due(message: &Message, now: DateTime<Utc>) -> bool {
    is_quota_parked(message) && is_due(message.transcription_next_attempt_at, now)
}

/// Message the general transcription requeue may enqueue.
///
/// Quota failures are exempt from the attempt ceiling.
pub fn transcription_retry_eligible(message: &Message, now: DateTime<Utc>, max_attempts: u32) -> bool {
    if message.is_deleted || message.is_transcribed || !message.to_transcribe {
        return false;
    }
    if !is_due(message.transcription_next_attempt_at, now) {
        return false;
    }
    message.transcription_retry_reason.as_deref() == Some(RETRY_REASON_QUOTA)
        || message.transcribe_attempts < max_attempts
}

/// Transcribed message whose categorization lock outlived `cutoff`.
pub fn has_stale_categorization_lock(message: &Message, cutoff: DateTime<Utc>) -> bool {
    message.is_transcribed && message.categorization_state().is_stale(cutoff)
}

/// Transcribed message with no categorization progress and no lock, whose
/// retry time (if any) has elapsed.
pub fn categorization_retry_eligible(message: &Message, now: DateTime<Utc>, max_attempts: u32) -> bool {
    if message.is_deleted || !message.is_transcribed {
        return false;
    }
    let state = message.categorization_state();
    if state.is_processed || state.is_processing {
        return false;
    }
    if !is_due(message.categorization_next_attempt_at, now) {
        return false;
    }
    message.categorization_retry_reason.as_deref() == Some(RETRY_REASON_QUOTA)
        || message.categorization_attempts < max_attempts
}

/// Session whose declared processors are all processed.
pub fn is_finalize_ready(session: &Session) -> bool {
    !session.is_deleted && !session.is_finalized && !session.is_corrupted && session.all_processors_done()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message() -> Message {
        Message::new("m1", "1", "s1", Utc::now())
    }

    #[test]
    fn test_future_retry_is_not_eligible() {
        let now = Utc::now();
        let mut m = message();
        m.transcription_next_attempt_at = Some(now + Duration::minutes(5));
        assert!(!transcription_retry_eligible(&m, now, 3));
        assert!(transcription_retry_eligible(&m, now + Duration::minutes(5), 3));
    }

    #[test]
    fn test_ceiling_applies_except_for_quota() {
        let now = Utc::now();
        let mut m = message();
        m.transcribe_attempts = 3;
        m.transcription_retry_reason = Some("transient_error".to_string());
        assert!(!transcription_retry_eligible(&m, now, 3));

        m.transcription_retry_reason = Some(RETRY_REASON_QUOTA.to_string());
        assert!(transcription_retry_eligible(&m, now, 3));
    }

    #[test]
    fn test_fatal_message_is_never_eligible() {
        let mut m = message();
        m.to_transcribe = false;
        m.transcription_error = Some("file_not_found".to_string());
        assert!(!transcription_retry_eligible(&m, Utc::now(), 3));
    }

    #[test]
    fn test_categorization_eligibility() {
        let now = Utc::now();
        let mut m = message();
        assert!(!categorization_retry_eligible(&m, now, 3));

        m.is_transcribed = true;
        assert!(categorization_retry_eligible(&m, now, 3));

        m.categorization_retry_reason = Some(RETRY_REASON_QUOTA.to_string());
        m.categorization_next_attempt_at = Some(now + Duration::minutes(1));
        assert!(!categorization_retry_eligible(&m, now, 3));

        m.categorization_next_attempt_at = Some(now - Duration::minutes(1));
        m.categorization_attempts = 10;
        assert!(categorization_retry_eligible(&m, now, 3));

        m.processors_data.get_mut("categorization").unwrap().is_processing = true;
        assert!(!categorization_retry_eligible(&m, now, 3));
    }

    #[test]
    fn test_quota_blocked_session() {
        let mut s = Session::new("s1", Utc::now());
        s.is_corrupted = true;
        s.error_source = Some(ERROR_SOURCE_TRANSCRIPTION.to_string());
        assert!(!is_quota_blocked(&s));

        s.transcription_error = Some(QUOTA_ERROR.to_string());
        assert!(is_quota_blocked(&s));
    }
}
