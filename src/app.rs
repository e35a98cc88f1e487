//! Wiring of store, queue and providers from a resolved config.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::adapters::{Categorizer, OpenAiClient, TelegramClient, Transcriber, WhisperTranscriber};
use crate::categorization::{CategorizationOptions, CategorizationWorker};
use crate::config::{ResolvedConfig, TranscriptionProvider};
use crate::finalize::QueueSideEffects;
use crate::queue::{JobQueue, JsonlJobQueue};
use crate::reconcile::{ReconcileSettings, Reconciler};
use crate::store::{Repo, RuntimeScope, SqliteStore};
use crate::transcription::{RetrySettings, TranscriptionOptions, TranscriptionWorker};
use crate::worker::{Handlers, LogEventSink, Worker};

/// Shared handles for one process
pub struct App {
    pub config: ResolvedConfig,
    pub repo: Repo,
    pub queue: Arc<dyn JobQueue>,
}

impl App {
    /// Open the store and queues described by `config`.
    pub fn open(config: ResolvedConfig) -> Result<Self> {
        config.validate()?;
        let store = SqliteStore::open(&config.database)
            .with_context(|| format!("Failed to open store: {}", config.database.display()))?;

        let scope = RuntimeScope::new(config.runtime_tag.clone());
        info!(
            runtime_tag = scope.runtime_tag(),
            prod = scope.is_prod(),
            database = %config.database.display(),
            "runtime scope"
        );

        let queue: Arc<dyn JobQueue> = Arc::new(JsonlJobQueue::new(config.queue_dir.clone()).with_retention(
            chrono::Duration::hours(config.workers.queue_retention_hours),
            config.workers.queue_compact_bytes,
        ));

        Ok(Self {
            repo: Repo::new(Arc::new(store), scope),
            queue,
            config,
        })
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.repo.clone(),
            self.queue.clone(),
            Arc::new(QueueSideEffects::new(self.queue.clone())),
            ReconcileSettings::from_config(&self.config),
        )
    }

    pub fn side_effects(&self) -> QueueSideEffects {
        QueueSideEffects::new(self.queue.clone())
    }

    fn transcriber(&self) -> Result<Arc<dyn Transcriber>> {
        let settings = &self.config.transcription;
        let transcriber: Arc<dyn Transcriber> = match settings.provider {
            TranscriptionProvider::Openai => {
                let mut client = OpenAiClient::new(
                    settings.base_url.clone(),
                    self.config.openai_api_key.clone(),
                    settings.model.clone(),
                    Duration::from_secs(settings.timeout_seconds),
                )?;
                if let Some(name) = &settings.server_name {
                    client = client.with_server_name(name.clone());
                }
                Arc::new(client)
            }
            TranscriptionProvider::Whisper => Arc::new(WhisperTranscriber::new(
                settings.whisper_path.clone(),
                settings.model.clone(),
                settings.language.clone(),
            )),
        };
        Ok(transcriber)
    }

    pub fn transcription_worker(&self) -> Result<TranscriptionWorker> {
        let settings = &self.config.transcription;
        let options = TranscriptionOptions {
            staging_dir: self.config.staging_dir.clone(),
            timeout: Duration::from_secs(settings.timeout_seconds),
            retry: RetrySettings::from_config(settings),
        };
        let mut worker = TranscriptionWorker::new(self.repo.clone(), self.queue.clone(), self.transcriber()?, options);

        if let Some(token) = &self.config.telegram_bot_token {
            let telegram = TelegramClient::new(
                token.clone(),
                self.config.telegram.api_base.clone(),
                Duration::from_secs(self.config.telegram.download_timeout_seconds),
            )?;
            worker = worker.with_telegram(Arc::new(telegram));
        }
        Ok(worker)
    }

    pub fn categorization_worker(&self) -> Result<CategorizationWorker> {
        let settings = &self.config.categorization;
        let categorizer: Arc<dyn Categorizer> = Arc::new(OpenAiClient::new(
            settings.base_url.clone(),
            self.config.openai_api_key.clone(),
            settings.model.clone(),
            Duration::from_secs(settings.timeout_seconds),
        )?);
        let options = CategorizationOptions {
            timeout: Duration::from_secs(settings.timeout_seconds),
            quota_backoff: chrono::Duration::minutes(settings.quota_backoff_minutes),
            ..CategorizationOptions::default()
        };
        Ok(CategorizationWorker::new(self.repo.clone(), categorizer, options))
    }

    pub fn worker(&self) -> Result<Worker> {
        let handlers = Handlers {
            repo: self.repo.clone(),
            transcription: self.transcription_worker()?,
            categorization: self.categorization_worker()?,
            events: Arc::new(LogEventSink),
        };
        Ok(Worker::new(
            self.queue.clone(),
            handlers,
            Duration::from_millis(self.config.workers.poll_interval_ms),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_store_under_home() {
        let temp = TempDir::new().unwrap();
        let config = ResolvedConfig::with_home(temp.path().join("state"));

        let app = App::open(config.clone()).unwrap();
        assert!(config.database.exists());
        assert!(app.repo.scope().is_prod());
        assert!(app.worker().is_ok());
    }

    #[test]
    fn test_open_rejects_invalid_durations() {
        let temp = TempDir::new().unwrap();
        let mut config = ResolvedConfig::with_home(temp.path().join("state"));
        config.scheduler.stale_lock_minutes = -1;

        assert!(App::open(config).is_err());
    }
}
