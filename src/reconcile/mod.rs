//! Reconciliation scheduler.
//!
//! A pass re-derives required work from persisted state alone and repairs
//! it in four sweeps:
//!
//! 1. Quota unblock: clear quota-blocked sessions and requeue their parked
//!    messages.
//! 2. Transcription requeue: enqueue every eligible untranscribed message of
//!    every pending session. `is_messages_processed` only orders the scan.
//! 3. Categorization: reset stale soft locks, enqueue messages whose
//!    categorization is due, and roll finished sessions up.
//! 4. Finalization: close up to `limit` ready sessions, newest first.
//!
//! Each sweep reads all of its candidates before mutating anything. Records
//! that changed in between are skipped silently; only store and queue errors
//! abort the pass.

pub mod eligibility;
pub mod scheduler;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::categorization::rollup_session;
use crate::domain::{
    CategorizePayload, JobKind, Message, Session, TranscribePayload, CATEGORIZATION,
    ERROR_SOURCE_TRANSCRIPTION,
};
use crate::finalize::{complete_session_done_flow, DoneParams, DoneSideEffects, DoneSource, FinalizeError};
use crate::queue::{EnqueueResult, JobQueue, NewJob, QueueError};
use crate::store::{Filter, FindOptions, Repo, SortOrder, StoreError, Update};
use crate::transcription::failure::RETRY_REASON_QUOTA;

use eligibility::QUOTA_ERROR;

pub use scheduler::Scheduler;

/// Errors that abort a reconciliation pass
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Finalization error: {0}")]
    Finalize(#[from] FinalizeError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Tuning for reconciliation passes
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// Sessions finalized per pass unless overridden
    pub finalize_limit: usize,
    /// Page size of store scans; every sweep still reads its whole backlog
    pub scan_window: usize,
    /// Age after which an unfinished categorization lock is reclaimed
    pub stale_lock: Duration,
    pub transcribe_max_attempts: u32,
    pub categorize_max_attempts: u32,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            finalize_limit: 3,
            scan_window: 200,
            stale_lock: Duration::minutes(15),
            transcribe_max_attempts: 3,
            categorize_max_attempts: 3,
        }
    }
}

impl ReconcileSettings {
    pub fn from_config(config: &crate::config::ResolvedConfig) -> Self {
        Self {
            finalize_limit: config.scheduler.finalize_limit,
            scan_window: config.scheduler.scan_window,
            stale_lock: Duration::minutes(config.scheduler.stale_lock_minutes),
            transcribe_max_attempts: config.transcription.max_attempts,
            categorize_max_attempts: config.categorization.max_attempts,
        }
    }
}

/// Per-pass options
#[derive(Debug, Clone, Copy, Default)]
pub struct PassOptions {
    /// Override the finalization budget
    pub limit: Option<usize>,
}

/// Counts reported by one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassResult {
    pub ok: bool,
    pub requeued_transcriptions: usize,
    pub requeued_categorizations: usize,
    pub reset_categorization_locks: usize,
    pub finalized_sessions: usize,
    pub unblocked_sessions: usize,
    pub categorized_sessions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs reconciliation passes against the store and queue
pub struct Reconciler {
    repo: Repo,
    queue: Arc<dyn JobQueue>,
    effects: Arc<dyn DoneSideEffects>,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(
        repo: Repo,
        queue: Arc<dyn JobQueue>,
        effects: Arc<dyn DoneSideEffects>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            repo,
            queue,
            effects,
            settings,
        }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    /// Run one pass now.
    pub async fn run_reconciliation_pass(&self, options: PassOptions) -> PassResult {
        self.run_reconciliation_pass_at(Utc::now(), options).await
    }

    /// Run one pass as of `now`.
    pub async fn run_reconciliation_pass_at(&self, now: DateTime<Utc>, options: PassOptions) -> PassResult {
        let mut result = PassResult::default();

        match self.sweep(now, options, &mut result).await {
            Ok(()) => {
                result.ok = true;
                info!(
                    requeued_transcriptions = result.requeued_transcriptions,
                    requeued_categorizations = result.requeued_categorizations,
                    reset_categorization_locks = result.reset_categorization_locks,
                    finalized_sessions = result.finalized_sessions,
                    "reconciliation pass complete"
                );
            }
            Err(e) => {
                error!(error = %e, "reconciliation pass aborted");
                result.ok = false;
                result.error = Some(e.to_string());
            }
        }
        result
    }

    async fn sweep(&self, now: DateTime<Utc>, options: PassOptions, result: &mut PassResult) -> Result<(), ReconcileError> {
        self.unblock_quota_sessions(now, result).await?;
        self.requeue_transcriptions(now, result).await?;
        self.sweep_categorization(now, result).await?;
        let limit = options.limit.unwrap_or(self.settings.finalize_limit);
        self.finalize_ready_sessions(now, limit, result).await?;
        Ok(())
    }

    // Sweep 1

    async fn unblock_quota_sessions(&self, now: DateTime<Utc>, result: &mut PassResult) -> Result<(), ReconcileError> {
        let blocked = self
            .repo
            .scan_sessions(
                Self::quota_blocked_filter(),
                FindOptions::default().sort_by("updated_at", SortOrder::Asc),
                self.settings.scan_window,
            )
            .await?;

        let mut plan: Vec<(Session, Vec<Message>)> = Vec::new();
        for session in blocked.into_iter().filter(eligibility::is_quota_blocked) {
            let parked: Vec<Message> = self
                .repo
                .session_messages(&session.id)
                .await?
                .into_iter()
                .filter(eligibility::is_quota_parked)
                .collect();

            // Stay blocked until the quota backoff has elapsed
            if !parked.is_empty() && !parked.iter().any(|m| eligibility::quota_retry_due(m, now)) {
                debug!(session_id = %session.id, "quota backoff not elapsed");
                continue;
            }
            plan.push((session, parked));
        }

        for (session, parked) in plan {
            let cleared = self
                .repo
                .update_session(
                    &session.id,
                    Self::quota_blocked_filter(),
                    Update::new()
                        .set("is_corrupted", false)
                        .unset("error_source")
                        .unset("transcription_error")
                        .touch(now),
                )
                .await?;
            if !cleared {
                continue;
            }
            result.unblocked_sessions += 1;
            info!(session_id = %session.id, messages = parked.len(), "cleared quota block");

            for message in parked {
                let flagged = self
                    .repo
                    .update_message(
                        &message.id,
                        Filter::and([
                            Filter::not_true("is_transcribed"),
                            Filter::eq("transcription_retry_reason", RETRY_REASON_QUOTA),
                        ]),
                        Update::new().set("to_transcribe", true).touch(now),
                    )
                    .await?;
                if !flagged || !eligibility::quota_retry_due(&message, now) {
                    continue;
                }
                if self.enqueue_transcribe(&message).await?.is_new() {
                    result.requeued_transcriptions += 1;
                }
            }
        }
        Ok(())
    }

    fn quota_blocked_filter() -> Filter {
        Filter::and([
            Filter::is_true("is_corrupted"),
            Filter::eq("error_source", ERROR_SOURCE_TRANSCRIPTION),
            Filter::eq("transcription_error", QUOTA_ERROR),
            Filter::not_true("is_deleted"),
        ])
    }

    // Sweep 2

    async fn requeue_transcriptions(&self, now: DateTime<Utc>, result: &mut PassResult) -> Result<(), ReconcileError> {
        let max_attempts = self.settings.transcribe_max_attempts;
        let messages = self
            .repo
            .scan_messages(
                Filter::and([
                    Filter::not_true("is_deleted"),
                    Filter::not_true("is_transcribed"),
                    Filter::is_true("to_transcribe"),
                    Filter::unset_or_before("transcription_next_attempt_at", now),
                    Filter::or([
                        Filter::eq("transcription_retry_reason", RETRY_REASON_QUOTA),
                        Filter::eq("transcribe_attempts", Value::Null),
                        Filter::lt("transcribe_attempts", max_attempts),
                    ]),
                ]),
                FindOptions::default().sort_by("created_at", SortOrder::Asc),
                self.settings.scan_window,
            )
            .await?;

        let mut by_session: BTreeMap<String, Vec<Message>> = BTreeMap::new();
        for message in messages
            .into_iter()
            .filter(|m| eligibility::transcription_retry_eligible(m, now, max_attempts))
        {
            by_session.entry(message.session_id.clone()).or_default().push(message);
        }

        let mut plan: Vec<(Session, Vec<Message>)> = Vec::new();
        for (session_id, messages) in by_session {
            let Some(session) = self.repo.get_session(&session_id).await? else {
                continue;
            };
            if session.is_deleted || session.is_finalized || session.is_transcription_blocked() {
                continue;
            }
            plan.push((session, messages));
        }

        // Not-yet-processed sessions first; processed ones are still requeued
        plan.sort_by(|(a, _), (b, _)| {
            a.is_messages_processed
                .cmp(&b.is_messages_processed)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });

        for message in plan.into_iter().flat_map(|(_, messages)| messages) {
            if self.enqueue_transcribe(&message).await?.is_new() {
                debug!(session_id = %message.session_id, message_id = %message.id, "requeued transcription");
                result.requeued_transcriptions += 1;
            }
        }
        Ok(())
    }

    async fn enqueue_transcribe(&self, message: &Message) -> Result<EnqueueResult, ReconcileError> {
        let key = crate::domain::jobs::message_job_key(&message.session_id, &message.message_id, JobKind::Transcribe);
        let payload = TranscribePayload {
            message_id: message.message_id.clone(),
            message_db_id: message.id.clone(),
            session_id: message.session_id.clone(),
            chat_id: message.chat_id,
            job_id: key.clone(),
        };
        Ok(self.queue.enqueue(NewJob::new(JobKind::Transcribe, key, &payload)?).await?)
    }

    // Sweep 3

    async fn sweep_categorization(&self, now: DateTime<Utc>, result: &mut PassResult) -> Result<(), ReconcileError> {
        let lock = format!("processors_data.{CATEGORIZATION}");
        let cutoff = now - self.settings.stale_lock;

        let stale = self
            .repo
            .scan_messages(
                Filter::and([
                    Filter::is_true("is_transcribed"),
                    Filter::not_true("is_deleted"),
                    Filter::not_true(format!("{lock}.is_processed")),
                    Self::stale_lock_filter(&lock, cutoff),
                ]),
                FindOptions::default().sort_by("updated_at", SortOrder::Asc),
                self.settings.scan_window,
            )
            .await?;
        let stale: Vec<Message> = stale
            .into_iter()
            .filter(|m| eligibility::has_stale_categorization_lock(m, cutoff))
            .collect();

        let max_attempts = self.settings.categorize_max_attempts;
        let due = self
            .repo
            .scan_messages(
                Filter::and([
                    Filter::is_true("is_transcribed"),
                    Filter::not_true("is_deleted"),
                    Filter::not_true(format!("{lock}.is_processed")),
                    Filter::not_true(format!("{lock}.is_processing")),
                    Filter::unset_or_before("categorization_next_attempt_at", now),
                    Filter::or([
                        Filter::eq("categorization_retry_reason", RETRY_REASON_QUOTA),
                        Filter::eq("categorization_attempts", Value::Null),
                        Filter::lt("categorization_attempts", max_attempts),
                    ]),
                ]),
                FindOptions::default().sort_by("updated_at", SortOrder::Asc),
                self.settings.scan_window,
            )
            .await?;
        let due: Vec<Message> = due
            .into_iter()
            .filter(|m| eligibility::categorization_retry_eligible(m, now, max_attempts))
            .collect();

        let sessions = self
            .repo
            .scan_sessions(
                Filter::and([
                    Filter::not_true("is_deleted"),
                    Filter::not_true("is_finalized"),
                    Filter::not_true(format!("{lock}.is_processed")),
                ]),
                FindOptions::default().sort_by("updated_at", SortOrder::Desc),
                self.settings.scan_window,
            )
            .await?;

        for message in stale {
            let reset = self
                .repo
                .update_message(
                    &message.id,
                    Self::stale_lock_filter(&lock, cutoff),
                    Update::new()
                        .set(format!("{lock}.is_processing"), false)
                        .unset(format!("{lock}.job_queued_timestamp"))
                        .touch(now),
                )
                .await?;
            if reset {
                warn!(session_id = %message.session_id, message_id = %message.id, "reset stale categorization lock");
                result.reset_categorization_locks += 1;
            }
        }

        for message in due {
            let payload = CategorizePayload {
                message_id: message.message_id.clone(),
                session_id: message.session_id.clone(),
                message_db_id: Some(message.id.clone()),
            };
            let queued = self
                .queue
                .enqueue(NewJob::new(JobKind::Categorize, payload.dedup_key(), &payload)?)
                .await?;
            if queued.is_new() {
                debug!(session_id = %message.session_id, message_id = %message.id, "requeued categorization");
                result.requeued_categorizations += 1;
            }
        }

        for session in sessions {
            if !session.session_processors.iter().any(|p| p == CATEGORIZATION) {
                continue;
            }
            if rollup_session(&self.repo, &session.id, now).await? {
                result.categorized_sessions += 1;
            }
        }
        Ok(())
    }

    /// Held, unfinished lock queued before `cutoff` (or never stamped).
    fn stale_lock_filter(lock: &str, cutoff: DateTime<Utc>) -> Filter {
        Filter::and([
            Filter::is_true(format!("{lock}.is_processing")),
            Filter::not_true(format!("{lock}.is_finished")),
            Filter::or([
                Filter::eq(format!("{lock}.job_queued_timestamp"), Value::Null),
                Filter::lt_time(format!("{lock}.job_queued_timestamp"), cutoff),
            ]),
        ])
    }

    // Sweep 4

    async fn finalize_ready_sessions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        result: &mut PassResult,
    ) -> Result<(), ReconcileError> {
        let ready: Vec<Session> = self
            .repo
            .find_sessions(
                Filter::and([
                    Filter::not_true("is_deleted"),
                    Filter::not_true("is_finalized"),
                    Filter::not_true("is_corrupted"),
                ]),
                FindOptions::default().sort_by("updated_at", SortOrder::Desc),
            )
            .await?
            .into_iter()
            .filter(eligibility::is_finalize_ready)
            .take(limit)
            .collect();

        for session in ready {
            let guard = session.session_processors.iter().fold(
                Filter::and([
                    Filter::not_true("is_deleted"),
                    Filter::not_true("is_finalized"),
                    Filter::not_true("is_corrupted"),
                ]),
                |guard, p| guard.and_also(Filter::is_true(format!("processors_data.{p}.is_processed"))),
            );

            let claimed = self
                .repo
                .update_session(
                    &session.id,
                    guard,
                    Update::new()
                        .set("is_finalized", true)
                        .set("is_postprocessing", true)
                        .touch(now),
                )
                .await?;
            if !claimed {
                debug!(session_id = %session.id, "session changed before finalization, skipping");
                continue;
            }
            result.finalized_sessions += 1;

            let params = DoneParams::new(session.id.clone(), DoneSource::Scheduler, now);
            let outcome = complete_session_done_flow(&self.repo, self.effects.as_ref(), &params).await?;
            if !outcome.ok {
                warn!(session_id = %session.id, error = ?outcome.error, "done flow did not complete");
            }
        }
        Ok(())
    }
}
