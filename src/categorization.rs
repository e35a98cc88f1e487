//! Categorization worker.
//!
//! Claims a message's categorization soft lock with a conditional update,
//! calls the categorizer, and releases the lock whatever the outcome. Once
//! every live message of a session is categorized, the session-level
//! categorization processor is marked processed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::adapters::{Categorizer, ProviderError};
use crate::domain::{CategorizePayload, Message, CATEGORIZATION};
use crate::store::{Filter, FindOptions, Repo, StoreError, Update};
use crate::transcription::failure::{RETRY_REASON_QUOTA, RETRY_REASON_TRANSIENT};

const LOCK: &str = "processors_data.categorization";

/// Infrastructure errors that abort a categorization job
#[derive(Debug, Error)]
pub enum CategorizationError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result of one CATEGORIZE job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategorizeOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message_id: String,
    pub session_id: String,
    /// Another worker holds the lock or the step is already done
    pub skipped: bool,
}

/// Worker settings
#[derive(Debug, Clone)]
pub struct CategorizationOptions {
    pub timeout: Duration,
    pub quota_backoff: chrono::Duration,
    pub retry_backoff: chrono::Duration,
}

impl Default for CategorizationOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            quota_backoff: chrono::Duration::minutes(10),
            retry_backoff: chrono::Duration::minutes(1),
        }
    }
}

/// Runs CATEGORIZE jobs against the store
pub struct CategorizationWorker {
    repo: Repo,
    categorizer: Arc<dyn Categorizer>,
    options: CategorizationOptions,
}

impl CategorizationWorker {
    pub fn new(repo: Repo, categorizer: Arc<dyn Categorizer>, options: CategorizationOptions) -> Self {
        Self {
            repo,
            categorizer,
            options,
        }
    }

    pub async fn handle_categorize_job(
        &self,
        payload: &CategorizePayload,
    ) -> Result<CategorizeOutcome, CategorizationError> {
        let outcome = |ok: bool, error: Option<&str>, skipped: bool| CategorizeOutcome {
            ok,
            error: error.map(str::to_string),
            message_id: payload.message_id.clone(),
            session_id: payload.session_id.clone(),
            skipped,
        };

        let Some(message) = self.find_message(payload).await? else {
            warn!(session_id = %payload.session_id, message_id = %payload.message_id, "message not found for categorization");
            return Ok(outcome(false, Some("message_not_found"), false));
        };

        if !message.is_transcribed {
            return Ok(outcome(false, Some("not_transcribed"), false));
        }

        let now = Utc::now();
        let claimed = self
            .repo
            .update_message(
                &message.id,
                Filter::and([
                    Filter::not_true(format!("{LOCK}.is_processing")),
                    Filter::not_true(format!("{LOCK}.is_processed")),
                ]),
                Update::new()
                    .set(format!("{LOCK}.is_processing"), true)
                    .set_time(format!("{LOCK}.job_queued_timestamp"), now)
                    .touch(now),
            )
            .await?;
        if !claimed {
            debug!(message_id = %message.id, "categorization already claimed or done");
            return Ok(outcome(true, None, true));
        }

        let text = message.transcription_text.clone().unwrap_or_default();
        let result = match tokio::time::timeout(self.options.timeout, self.categorizer.categorize(&text)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        };

        let held = Filter::is_true(format!("{LOCK}.is_processing"));
        let now = Utc::now();
        match result {
            Ok(rows) => {
                let update = Update::new()
                    .set_json("categorization", &rows)?
                    .set(format!("{LOCK}.is_processing"), false)
                    .set(format!("{LOCK}.is_processed"), true)
                    .set(format!("{LOCK}.is_finished"), true)
                    .unset("categorization_error")
                    .unset("categorization_retry_reason")
                    .unset("categorization_next_attempt_at")
                    .touch(now);
                self.repo.update_message(&message.id, held, update).await?;
                info!(session_id = %message.session_id, message_id = %message.id, rows = rows.len(), "categorized message");

                rollup_session(&self.repo, &message.session_id, now).await?;
                Ok(outcome(true, None, false))
            }
            Err(e) => {
                let (reason, delay) = if e.is_quota() {
                    (RETRY_REASON_QUOTA, self.options.quota_backoff)
                } else {
                    (RETRY_REASON_TRANSIENT, self.options.retry_backoff)
                };
                let update = Update::new()
                    .set(format!("{LOCK}.is_processing"), false)
                    .unset(format!("{LOCK}.job_queued_timestamp"))
                    .set("categorization_error", e.to_string())
                    .set("categorization_retry_reason", reason)
                    .set_time("categorization_next_attempt_at", now + delay)
                    .inc("categorization_attempts", 1)
                    .touch(now);
                self.repo.update_message(&message.id, held, update).await?;
                warn!(session_id = %message.session_id, message_id = %message.id, error = %e, "categorization failed");
                Ok(outcome(false, Some(reason), false))
            }
        }
    }

    async fn find_message(&self, payload: &CategorizePayload) -> Result<Option<Message>, StoreError> {
        if let Some(id) = payload.message_db_id.as_deref() {
            return self.repo.get_message(id).await;
        }
        let mut found = self
            .repo
            .find_messages(
                Filter::and([
                    Filter::eq("session_id", payload.session_id.clone()),
                    Filter::eq("message_id", payload.message_id.clone()),
                    Filter::not_true("is_deleted"),
                ]),
                FindOptions::default().limit(1),
            )
            .await?;
        Ok(found.pop())
    }
}

/// True when the message counts as categorized for the session rollup.
pub fn is_categorized(message: &Message) -> bool {
    message.is_transcribed && message.categorization_state().is_processed
}

/// Mark the session's categorization processor done once every live message
/// is categorized. Returns true when the session was updated.
pub async fn rollup_session(repo: &Repo, session_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
    let messages = repo.session_messages(session_id).await?;
    if messages.is_empty() || !messages.iter().all(is_categorized) {
        return Ok(false);
    }

    let path = format!("processors_data.{CATEGORIZATION}");
    let updated = repo
        .update_session(
            session_id,
            Filter::not_true(format!("{path}.is_processed")),
            Update::new()
                .set(format!("{path}.is_processed"), true)
                .set(format!("{path}.is_finished"), true)
                .set(format!("{path}.is_processing"), false)
                .set("is_messages_processed", true)
                .touch(now),
        )
        .await?;

    if updated {
        info!(session_id = %session_id, messages = messages.len(), "session categorization complete");
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Session;
    use crate::store::{RuntimeScope, SqliteStore};
    use async_trait::async_trait;
    use serde_json::Value;

    struct StubCategorizer {
        quota: bool,
    }

    #[async_trait]
    impl Categorizer for StubCategorizer {
        async fn categorize(&self, text: &str) -> Result<Vec<Value>, ProviderError> {
            if self.quota {
                return Err(ProviderError::from_status(429, None, "quota".to_string()));
            }
            Ok(vec![serde_json::json!({ "text": text, "topic": "general" })])
        }
    }

    async fn setup(quota: bool) -> (Repo, CategorizationWorker) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let repo = Repo::new(store, RuntimeScope::new("prod"));
        repo.insert_session(&Session::new("s1", Utc::now()).with_processors([CATEGORIZATION]))
            .await
            .unwrap();

        for (id, source) in [("m1", "1"), ("m2", "2")] {
            let mut msg = Message::new(id, source, "s1", Utc::now());
            msg.is_transcribed = true;
            msg.to_transcribe = false;
            msg.transcription_text = Some(format!("text {id}"));
            repo.insert_message(&msg).await.unwrap();
        }

        let worker = CategorizationWorker::new(
            repo.clone(),
            Arc::new(StubCategorizer { quota }),
            CategorizationOptions::default(),
        );
        (repo, worker)
    }

    fn payload(message_id: &str, db_id: &str) -> CategorizePayload {
        CategorizePayload {
            message_id: message_id.to_string(),
            session_id: "s1".to_string(),
            message_db_id: Some(db_id.to_string()),
        }
    }

    #[tokio::test]
    async fn test_success_releases_lock_and_rolls_up() {
        let (repo, worker) = setup(false).await;

        let first = worker.handle_categorize_job(&payload("1", "m1")).await.unwrap();
        assert!(first.ok && !first.skipped);

        let m1 = repo.get_message("m1").await.unwrap().unwrap();
        let state = m1.categorization_state();
        assert!(state.is_processed && state.is_finished && !state.is_processing);
        assert_eq!(m1.categorization.len(), 1);

        // One message left: session not yet done
        let session = repo.get_session("s1").await.unwrap().unwrap();
        assert!(!session.all_processors_done());

        worker.handle_categorize_job(&payload("2", "m2")).await.unwrap();
        let session = repo.get_session("s1").await.unwrap().unwrap();
        assert!(session.all_processors_done());
        assert!(session.is_messages_processed);
    }

    #[tokio::test]
    async fn test_done_message_is_skipped() {
        let (_repo, worker) = setup(false).await;
        worker.handle_categorize_job(&payload("1", "m1")).await.unwrap();

        let again = worker.handle_categorize_job(&payload("1", "m1")).await.unwrap();
        assert!(again.skipped);
    }

    #[tokio::test]
    async fn test_lookup_by_source_id() {
        let (_repo, worker) = setup(false).await;
        let mut p = payload("2", "ignored");
        p.message_db_id = None;

        let outcome = worker.handle_categorize_job(&p).await.unwrap();
        assert!(outcome.ok);
    }

    #[tokio::test]
    async fn test_quota_failure_schedules_retry_and_unlocks() {
        let (repo, worker) = setup(true).await;

        let outcome = worker.handle_categorize_job(&payload("1", "m1")).await.unwrap();
        assert_eq!(outcome.error.as_deref(), Some(RETRY_REASON_QUOTA));

        let m1 = repo.get_message("m1").await.unwrap().unwrap();
        assert!(!m1.categorization_state().is_processing);
        assert!(m1.categorization_state().job_queued_timestamp.is_none());
        assert_eq!(m1.categorization_retry_reason.as_deref(), Some(RETRY_REASON_QUOTA));
        assert!(m1.categorization_next_attempt_at.unwrap() > Utc::now());
        assert_eq!(m1.categorization_attempts, 1);
    }
}
