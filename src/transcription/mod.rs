//! Transcription worker.
//!
//! Handles one TRANSCRIBE job: resolves the audio transport, calls the
//! transcriber, and writes either the transcript or classified failure
//! metadata. Store and queue errors are returned as `Err`; everything else
//! ends up in the [`TranscribeOutcome`] and on the message record.

pub mod failure;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::adapters::{ProviderError, TelegramError, TelegramFiles, Transcriber, Transcript};
use crate::domain::message::TRANSPORT_TELEGRAM_DOWNLOAD;
use crate::domain::{
    CategorizePayload, ErrorContext, JobKind, Message, SessionEventPayload, SocketEvent,
    TranscribePayload, ERROR_SOURCE_TRANSCRIPTION,
};
use crate::queue::{JobQueue, NewJob, QueueError};
use crate::store::{Filter, Repo, StoreError, Update};

pub use failure::{mask_secret, RetryPolicy, RetrySettings, TranscriptionFailure};

/// Infrastructure errors that abort a transcription job
#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result of one TRANSCRIBE job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscribeOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message_id: String,
    pub session_id: String,
}

impl TranscribeOutcome {
    fn ok(payload: &TranscribePayload) -> Self {
        Self {
            ok: true,
            error: None,
            message_id: payload.message_id.clone(),
            session_id: payload.session_id.clone(),
        }
    }

    fn failed(payload: &TranscribePayload, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Self::ok(payload)
        }
    }
}

/// Worker settings
#[derive(Debug, Clone)]
pub struct TranscriptionOptions {
    /// Where Telegram downloads are written
    pub staging_dir: PathBuf,
    /// Upper bound on one provider call
    pub timeout: Duration,
    pub retry: RetrySettings,
}

/// A classified failure with its diagnostic detail
#[derive(Debug)]
struct Failed {
    kind: TranscriptionFailure,
    file_path: Option<String>,
    provider: Option<ProviderError>,
    detail: String,
}

impl Failed {
    fn new(kind: TranscriptionFailure, detail: impl Into<String>) -> Self {
        Self {
            kind,
            file_path: None,
            provider: None,
            detail: detail.into(),
        }
    }

    fn with_path(mut self, path: &Path) -> Self {
        self.file_path = Some(path.display().to_string());
        self
    }
}

/// Runs TRANSCRIBE jobs against the store
pub struct TranscriptionWorker {
    repo: Repo,
    queue: Arc<dyn JobQueue>,
    transcriber: Arc<dyn Transcriber>,
    telegram: Option<Arc<dyn TelegramFiles>>,
    settings: TranscriptionOptions,
}

impl TranscriptionWorker {
    pub fn new(
        repo: Repo,
        queue: Arc<dyn JobQueue>,
        transcriber: Arc<dyn Transcriber>,
        settings: TranscriptionOptions,
    ) -> Self {
        Self {
            repo,
            queue,
            transcriber,
            telegram: None,
            settings,
        }
    }

    /// Enable Telegram downloads for messages without a local file
    pub fn with_telegram(mut self, telegram: Arc<dyn TelegramFiles>) -> Self {
        self.telegram = Some(telegram);
        self
    }

    /// Handle one TRANSCRIBE job.
    pub async fn handle_transcribe_job(
        &self,
        payload: &TranscribePayload,
    ) -> Result<TranscribeOutcome, TranscriptionError> {
        let Some(message) = self.repo.get_message(&payload.message_db_id).await? else {
            warn!(message_db_id = %payload.message_db_id, "message not found for transcription");
            return Ok(TranscribeOutcome::failed(payload, "message_not_found"));
        };

        if message.is_transcribed {
            debug!(message_id = %message.id, "message already transcribed");
            return Ok(TranscribeOutcome::ok(payload));
        }

        if let Some(session) = self.repo.get_session(&message.session_id).await? {
            if session.is_transcription_blocked() {
                info!(session_id = %session.id, message_id = %message.id, "session blocked on quota, skipping");
                return Ok(TranscribeOutcome::failed(payload, "session_blocked"));
            }
        }

        let path = match self.resolve_transport(&message).await? {
            Ok(path) => path,
            Err(failed) => return self.record_failure(payload, &message, failed).await,
        };

        let transcript = match self.call_provider(&path).await {
            Ok(transcript) => transcript,
            Err(failed) => return self.record_failure(payload, &message, failed.with_path(&path)).await,
        };

        self.record_success(payload, &message, transcript).await
    }

    /// Find a local audio file for the message, downloading it if needed.
    ///
    /// The outer `Result` carries store errors, the inner one a classified
    /// failure.
    async fn resolve_transport(
        &self,
        message: &Message,
    ) -> Result<Result<PathBuf, Failed>, TranscriptionError> {
        if let Some(path) = message.file_path.as_deref().filter(|p| !p.is_empty()) {
            let path = PathBuf::from(path);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(Err(Failed::new(
                    TranscriptionFailure::FileNotFound,
                    "audio file does not exist",
                )
                .with_path(&path)));
            }
            return Ok(Ok(path));
        }

        let Some(file_id) = message.file_id.as_deref().filter(|f| !f.is_empty()) else {
            return Ok(Err(Failed::new(
                TranscriptionFailure::MissingTransport,
                "message has neither file_path nor file_id",
            )));
        };

        let Some(telegram) = self.telegram.as_ref() else {
            return Ok(Err(Failed::new(
                TranscriptionFailure::MissingTransport,
                "no Telegram client configured for file download",
            )));
        };

        let downloaded = match self.download(telegram.as_ref(), message, file_id).await {
            Ok(downloaded) => downloaded,
            Err(failed) => return Ok(Err(failed)),
        };

        // Persist the transport before transcribing so a retry does not re-download
        let mut update = Update::new()
            .set("file_path", downloaded.path.display().to_string())
            .set("file_transport", TRANSPORT_TELEGRAM_DOWNLOAD)
            .set("file_size", downloaded.size)
            .touch(Utc::now());
        if message.file_hash.is_none() {
            update = update.set("file_hash", downloaded.sha256);
        }
        self.repo
            .update_message(&message.id, Filter::not_true("is_transcribed"), update)
            .await?;

        info!(message_id = %message.id, path = %downloaded.path.display(), "downloaded Telegram file");
        Ok(Ok(downloaded.path))
    }

    async fn download(
        &self,
        telegram: &dyn TelegramFiles,
        message: &Message,
        file_id: &str,
    ) -> Result<Downloaded, Failed> {
        let file = telegram.get_file(file_id).await.map_err(classify_telegram)?;

        let Some(remote_path) = file.file_path else {
            return Err(Failed::new(
                TranscriptionFailure::MissingTransport,
                format!("Telegram returned no file_path for {}", file_id),
            ));
        };

        let extension = Path::new(&remote_path)
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "oga".to_string());
        let dest = self.settings.staging_dir.join(format!("{}.{}", message.id, extension));

        let size = telegram
            .download_file(&remote_path, &dest)
            .await
            .map_err(classify_telegram)?;

        let sha256 = hash_file(&dest)
            .await
            .map_err(|e| Failed::new(TranscriptionFailure::Transient, e.to_string()).with_path(&dest))?;

        Ok(Downloaded { path: dest, size, sha256 })
    }

    async fn call_provider(&self, path: &Path) -> Result<Transcript, Failed> {
        match tokio::time::timeout(self.settings.timeout, self.transcriber.transcribe(path)).await {
            Ok(Ok(transcript)) => Ok(transcript),
            Ok(Err(e)) => Err(Failed {
                kind: TranscriptionFailure::from_provider(&e),
                file_path: None,
                detail: e.to_string(),
                provider: Some(e),
            }),
            Err(_) => Err(Failed {
                kind: TranscriptionFailure::Transient,
                file_path: None,
                detail: format!("provider call exceeded {:?}", self.settings.timeout),
                provider: Some(ProviderError::Timeout),
            }),
        }
    }

    async fn record_success(
        &self,
        payload: &TranscribePayload,
        message: &Message,
        transcript: Transcript,
    ) -> Result<TranscribeOutcome, TranscriptionError> {
        let now = Utc::now();
        let update = Update::new()
            .set("transcription_text", transcript.text)
            .set_json("transcription_segments", &transcript.segments)?
            .set("is_transcribed", true)
            .set("to_transcribe", false)
            .set_time("transcribed_at", now)
            .unset("transcription_error")
            .unset("transcription_error_context")
            .unset("transcription_retry_reason")
            .unset("transcription_next_attempt_at")
            .touch(now);

        let written = self
            .repo
            .update_message(&message.id, Filter::not_true("is_transcribed"), update)
            .await?;
        if !written {
            debug!(message_id = %message.id, "message transcribed concurrently");
            return Ok(TranscribeOutcome::ok(payload));
        }

        let categorize = CategorizePayload {
            message_id: message.message_id.clone(),
            session_id: message.session_id.clone(),
            message_db_id: Some(message.id.clone()),
        };
        self.queue
            .enqueue(NewJob::new(JobKind::Categorize, categorize.dedup_key(), &categorize)?)
            .await?;

        let event = SessionEventPayload::new(
            message.session_id.clone(),
            SocketEvent::MessageUpdate,
            serde_json::json!({
                "message_id": message.message_id,
                "message_db_id": message.id,
                "is_transcribed": true,
            }),
        );
        self.queue
            .enqueue(NewJob::new(JobKind::SessionEvent, event.dedup_key(), &event)?)
            .await?;

        info!(session_id = %message.session_id, message_id = %message.id, "transcribed message");
        Ok(TranscribeOutcome::ok(payload))
    }

    async fn record_failure(
        &self,
        payload: &TranscribePayload,
        message: &Message,
        failed: Failed,
    ) -> Result<TranscribeOutcome, TranscriptionError> {
        let now = Utc::now();
        let attempts = message.transcribe_attempts + 1;

        let context = ErrorContext {
            server_name: Some(self.transcriber.server_name().to_string()),
            masked_key: self.transcriber.credential().map(mask_secret),
            error_code: Some(
                failed
                    .provider
                    .as_ref()
                    .and_then(ProviderError::code)
                    .unwrap_or(failed.kind.code())
                    .to_string(),
            ),
            http_status: failed.provider.as_ref().and_then(ProviderError::http_status),
            file_path: failed.file_path.clone().or_else(|| message.file_path.clone()),
            detail: Some(failed.detail.clone()),
        };

        let update = failed
            .kind
            .message_update(&self.settings.retry, attempts, &context, now)?;
        self.repo
            .update_message(&message.id, Filter::not_true("is_transcribed"), update)
            .await?;

        if failed.kind == TranscriptionFailure::QuotaExceeded {
            self.repo
                .update_session(
                    &message.session_id,
                    Filter::All,
                    Update::new()
                        .set("is_corrupted", true)
                        .set("error_source", ERROR_SOURCE_TRANSCRIPTION)
                        .set("transcription_error", failed.kind.code())
                        .touch(now),
                )
                .await?;
        }

        warn!(
            session_id = %message.session_id,
            message_id = %message.id,
            error = %failed.kind,
            attempts,
            detail = %failed.detail,
            "transcription failed"
        );
        Ok(TranscribeOutcome::failed(payload, failed.kind.code()))
    }
}

struct Downloaded {
    path: PathBuf,
    size: u64,
    sha256: String,
}

/// API refusals mean the file cannot be fetched; network errors may pass.
fn classify_telegram(err: TelegramError) -> Failed {
    let kind = match err {
        TelegramError::Api(_) | TelegramError::MissingFilePath(_) => TranscriptionFailure::MissingTransport,
        TelegramError::Http(_) | TelegramError::Io(_) => TranscriptionFailure::Transient,
    };
    Failed::new(kind, err.to_string())
}

/// SHA-256 of a file, hex encoded
async fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::TelegramFile;
    use crate::domain::Session;
    use crate::queue::JsonlJobQueue;
    use crate::store::{RuntimeScope, SqliteStore};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct StubTranscriber {
        result: fn() -> Result<Transcript, ProviderError>,
    }

    #[async_trait]
    impl Transcriber for StubTranscriber {
        fn server_name(&self) -> &str {
            "stub.local"
        }

        fn credential(&self) -> Option<&str> {
            Some("sk-test-abcdefghijkl")
        }

        async fn transcribe(&self, _audio_path: &Path) -> Result<Transcript, ProviderError> {
            (self.result)()
        }
    }

    fn hello() -> Result<Transcript, ProviderError> {
        Ok(Transcript {
            text: "hello".to_string(),
            ..Default::default()
        })
    }

    fn quota() -> Result<Transcript, ProviderError> {
        Err(ProviderError::from_status(
            429,
            Some("insufficient_quota".to_string()),
            "quota".to_string(),
        ))
    }

    fn flaky() -> Result<Transcript, ProviderError> {
        Err(ProviderError::Transport("connection reset".to_string()))
    }

    struct StubTelegram {
        file_path: Option<&'static str>,
    }

    #[async_trait]
    impl TelegramFiles for StubTelegram {
        async fn get_file(&self, file_id: &str) -> Result<TelegramFile, TelegramError> {
            Ok(TelegramFile {
                file_id: file_id.to_string(),
                file_unique_id: None,
                file_size: Some(4),
                file_path: self.file_path.map(str::to_string),
            })
        }

        async fn download_file(&self, _remote_path: &str, dest: &Path) -> Result<u64, TelegramError> {
            tokio::fs::create_dir_all(dest.parent().unwrap()).await?;
            tokio::fs::write(dest, b"OggS").await?;
            Ok(4)
        }
    }

    struct Fixture {
        repo: Repo,
        queue: Arc<JsonlJobQueue>,
        temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        Fixture {
            repo: Repo::new(store, RuntimeScope::new("prod")),
            queue: Arc::new(JsonlJobQueue::new(temp.path().join("queues"))),
            temp,
        }
    }

    fn worker(f: &Fixture, result: fn() -> Result<Transcript, ProviderError>) -> TranscriptionWorker {
        TranscriptionWorker::new(
            f.repo.clone(),
            f.queue.clone(),
            Arc::new(StubTranscriber { result }),
            TranscriptionOptions {
                staging_dir: f.temp.path().join("staging"),
                timeout: Duration::from_secs(5),
                retry: RetrySettings::default(),
            },
        )
    }

    fn payload(message: &Message) -> TranscribePayload {
        let key = crate::domain::jobs::message_job_key(&message.session_id, &message.message_id, JobKind::Transcribe);
        TranscribePayload {
            message_id: message.message_id.clone(),
            message_db_id: message.id.clone(),
            session_id: message.session_id.clone(),
            chat_id: None,
            job_id: key,
        }
    }

    async fn seed(f: &Fixture, message: Message) -> Message {
        let session = Session::new(message.session_id.clone(), Utc::now());
        if f.repo.get_session(&session.id).await.unwrap().is_none() {
            f.repo.insert_session(&session).await.unwrap();
        }
        f.repo.insert_message(&message).await.unwrap();
        message
    }

    #[tokio::test]
    async fn test_success_writes_transcript_and_enqueues_followups() {
        let f = fixture();
        let audio = f.temp.path().join("a.ogg");
        std::fs::write(&audio, b"OggS").unwrap();

        let mut msg = Message::new("m1", "100", "s1", Utc::now());
        msg.file_path = Some(audio.display().to_string());
        let msg = seed(&f, msg).await;

        let outcome = worker(&f, hello).handle_transcribe_job(&payload(&msg)).await.unwrap();
        assert!(outcome.ok);

        let stored = f.repo.get_message("m1").await.unwrap().unwrap();
        assert!(stored.is_transcribed);
        assert!(!stored.to_transcribe);
        assert_eq!(stored.transcription_text.as_deref(), Some("hello"));

        let processors = f.queue.jobs(crate::domain::QueueName::Processors).await.unwrap();
        assert_eq!(processors.len(), 1);
        assert_eq!(processors[0].dedup_key, "s1-100-CATEGORIZE");
        let events = f.queue.jobs(crate::domain::QueueName::Events).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_already_transcribed_is_noop() {
        let f = fixture();
        let mut msg = Message::new("m1", "100", "s1", Utc::now());
        msg.is_transcribed = true;
        let msg = seed(&f, msg).await;

        let outcome = worker(&f, quota).handle_transcribe_job(&payload(&msg)).await.unwrap();
        assert!(outcome.ok);
        assert!(f.queue.jobs(crate::domain::QueueName::Processors).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quota_failure_blocks_session() {
        let f = fixture();
        let audio = f.temp.path().join("a.ogg");
        std::fs::write(&audio, b"OggS").unwrap();

        let mut msg = Message::new("m1", "100", "s1", Utc::now());
        msg.file_path = Some(audio.display().to_string());
        msg.transcribe_attempts = 4;
        let msg = seed(&f, msg).await;

        let outcome = worker(&f, quota).handle_transcribe_job(&payload(&msg)).await.unwrap();
        assert_eq!(outcome.error.as_deref(), Some("insufficient_quota"));

        let stored = f.repo.get_message("m1").await.unwrap().unwrap();
        assert!(!stored.to_transcribe);
        assert_eq!(stored.transcribe_attempts, 5);
        assert_eq!(stored.transcription_retry_reason.as_deref(), Some("insufficient_quota"));
        assert!(stored.transcription_next_attempt_at.unwrap() > Utc::now());

        let ctx = stored.transcription_error_context.unwrap();
        assert_eq!(ctx.server_name.as_deref(), Some("stub.local"));
        assert_eq!(ctx.masked_key.as_deref(), Some("sk-t...ijkl"));
        assert_eq!(ctx.http_status, Some(429));

        let session = f.repo.get_session("s1").await.unwrap().unwrap();
        assert!(session.is_transcription_blocked());
        assert_eq!(session.transcription_error.as_deref(), Some("insufficient_quota"));

        // A blocked session is not processed again
        let again = worker(&f, hello).handle_transcribe_job(&payload(&msg)).await.unwrap();
        assert_eq!(again.error.as_deref(), Some("session_blocked"));
        assert!(!f.repo.get_message("m1").await.unwrap().unwrap().is_transcribed);
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_retry() {
        let f = fixture();
        let audio = f.temp.path().join("a.ogg");
        std::fs::write(&audio, b"OggS").unwrap();

        let mut msg = Message::new("m1", "100", "s1", Utc::now());
        msg.file_path = Some(audio.display().to_string());
        let msg = seed(&f, msg).await;

        let outcome = worker(&f, flaky).handle_transcribe_job(&payload(&msg)).await.unwrap();
        assert_eq!(outcome.error.as_deref(), Some("transcription_failed"));

        let stored = f.repo.get_message("m1").await.unwrap().unwrap();
        assert!(stored.to_transcribe);
        assert_eq!(stored.transcribe_attempts, 1);
        assert_eq!(stored.transcription_retry_reason.as_deref(), Some("transient_error"));

        let session = f.repo.get_session("s1").await.unwrap().unwrap();
        assert!(!session.is_corrupted);
    }

    #[tokio::test]
    async fn test_transient_failure_at_ceiling_stops_retrying() {
        let f = fixture();
        let audio = f.temp.path().join("a.ogg");
        std::fs::write(&audio, b"OggS").unwrap();

        let mut msg = Message::new("m1", "100", "s1", Utc::now());
        msg.file_path = Some(audio.display().to_string());
        msg.transcribe_attempts = 2;
        let msg = seed(&f, msg).await;

        let outcome = worker(&f, flaky).handle_transcribe_job(&payload(&msg)).await.unwrap();
        assert_eq!(outcome.error.as_deref(), Some("transcription_failed"));

        let stored = f.repo.get_message("m1").await.unwrap().unwrap();
        assert_eq!(stored.transcribe_attempts, 3);
        assert!(!stored.to_transcribe);
        assert!(stored.transcription_next_attempt_at.is_none());
        assert_eq!(stored.transcription_retry_reason.as_deref(), Some("transient_error"));
        assert_eq!(stored.transcription_error.as_deref(), Some("transcription_failed"));
    }

    #[tokio::test]
    async fn test_telegram_download_persists_transport() {
        let f = fixture();
        let mut msg = Message::new("m1", "100", "s1", Utc::now());
        msg.source_type = Some("telegram".to_string());
        msg.file_id = Some("AwACAgI".to_string());
        let msg = seed(&f, msg).await;

        let outcome = worker(&f, hello)
            .with_telegram(Arc::new(StubTelegram {
                file_path: Some("voice/file_7.oga"),
            }))
            .handle_transcribe_job(&payload(&msg))
            .await
            .unwrap();
        assert!(outcome.ok);

        let stored = f.repo.get_message("m1").await.unwrap().unwrap();
        assert_eq!(stored.file_transport.as_deref(), Some(TRANSPORT_TELEGRAM_DOWNLOAD));
        assert!(stored.file_path.unwrap().ends_with("staging/m1.oga"));
        assert_eq!(stored.file_size, Some(4));
        assert_eq!(stored.file_hash.map(|h| h.len()), Some(64));
    }

    #[tokio::test]
    async fn test_file_id_without_client_is_missing_transport() {
        let f = fixture();
        let mut msg = Message::new("m1", "100", "s1", Utc::now());
        msg.file_id = Some("AwACAgI".to_string());
        let msg = seed(&f, msg).await;

        let outcome = worker(&f, hello).handle_transcribe_job(&payload(&msg)).await.unwrap();
        assert_eq!(outcome.error.as_deref(), Some("missing_transport"));

        let stored = f.repo.get_message("m1").await.unwrap().unwrap();
        assert!(!stored.to_transcribe);
        assert!(stored.transcription_error_context.is_some());
    }

    #[tokio::test]
    async fn test_telegram_without_file_path_is_missing_transport() {
        let f = fixture();
        let mut msg = Message::new("m1", "100", "s1", Utc::now());
        msg.file_id = Some("AwACAgI".to_string());
        let msg = seed(&f, msg).await;

        let outcome = worker(&f, hello)
            .with_telegram(Arc::new(StubTelegram { file_path: None }))
            .handle_transcribe_job(&payload(&msg))
            .await
            .unwrap();
        assert_eq!(outcome.error.as_deref(), Some("missing_transport"));
    }
}
