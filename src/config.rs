//! Configuration for voicebot.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (VOICEBOT_HOME, VOICEBOT_RUNTIME_TAG,
//!    OPENAI_API_KEY, TELEGRAM_BOT_TOKEN)
//! 2. Config file (.voicebot/config.yaml)
//! 3. Defaults (~/.voicebot, runtime `prod`)
//!
//! Config file discovery:
//! - Searches current directory and parents for .voicebot/config.yaml
//! - Paths in config file are relative to the .voicebot/ directory
//!
//! The resolved config is passed explicitly to every component; in
//! particular the runtime tag reaches the store only through
//! [`crate::store::RuntimeScope`].

pub mod paths;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub runtime_tag: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub transcription: TranscriptionSettings,
    #[serde(default)]
    pub categorization: CategorizationSettings,
    #[serde(default)]
    pub telegram: TelegramSettings,
    #[serde(default)]
    pub workers: WorkerSettings,
    #[serde(default)]
    pub watchdog: WatchdogSettings,
    #[serde(default)]
    pub maintenance: MaintenanceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .voicebot/)
    pub home: Option<String>,
    pub database: Option<String>,
    pub queues: Option<String>,
    pub staging: Option<String>,
}

/// Reconciliation scheduler settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Seconds between passes
    pub interval_seconds: u64,
    /// Sessions finalized per pass
    pub finalize_limit: usize,
    /// Records read per store query while a sweep scans its backlog
    pub scan_window: usize,
    /// Age after which an unfinished processing lock is reclaimed
    pub stale_lock_minutes: i64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            finalize_limit: 3,
            scan_window: 200,
            stale_lock_minutes: 15,
        }
    }
}

/// Which speech-to-text backend to call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionProvider {
    /// OpenAI-compatible `/audio/transcriptions` endpoint
    Openai,
    /// Local whisper binary
    Whisper,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscriptionSettings {
    pub provider: TranscriptionProvider,
    pub model: String,
    pub base_url: String,
    /// Human-readable server identity recorded in error context
    pub server_name: Option<String>,
    pub whisper_path: String,
    pub language: Option<String>,
    pub timeout_seconds: u64,
    /// Attempt ceiling for non-quota failures
    pub max_attempts: u32,
    pub quota_backoff_minutes: i64,
    pub retry_base_seconds: i64,
    pub retry_max_seconds: i64,
}

impl Default for TranscriptionSettings {
    fn default() -> Self {
        Self {
            provider: TranscriptionProvider::Openai,
            model: "whisper-1".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            server_name: None,
            whisper_path: "whisper".to_string(),
            language: None,
            timeout_seconds: 300,
            max_attempts: 3,
            quota_backoff_minutes: 10,
            retry_base_seconds: 60,
            retry_max_seconds: 1800,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CategorizationSettings {
    pub model: String,
    pub base_url: String,
    pub timeout_seconds: u64,
    pub max_attempts: u32,
    pub quota_backoff_minutes: i64,
}

impl Default for CategorizationSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout_seconds: 120,
            max_attempts: 3,
            quota_backoff_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramSettings {
    pub api_base: String,
    pub download_timeout_seconds: u64,
}

impl Default for TelegramSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.telegram.org".to_string(),
            download_timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub transcribe_concurrency: usize,
    pub processors_concurrency: usize,
    pub events_concurrency: usize,
    pub poll_interval_ms: u64,
    /// Hours finished jobs stay in the queue logs
    pub queue_retention_hours: i64,
    /// Queue log size that triggers compaction
    pub queue_compact_bytes: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            transcribe_concurrency: 2,
            processors_concurrency: 2,
            events_concurrency: 1,
            poll_interval_ms: 1000,
            queue_retention_hours: 24,
            queue_compact_bytes: 1024 * 1024,
        }
    }
}

/// Dependency watchdog settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub health_url: Option<String>,
    /// Command and arguments run to restart the service
    pub restart_command: Vec<String>,
    pub timeout_seconds: u64,
    /// Wait after a restart before checking again
    pub settle_seconds: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            health_url: None,
            restart_command: Vec::new(),
            timeout_seconds: 10,
            settle_seconds: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    /// Inactivity after which `close-idle` closes a session
    pub idle_hours: f64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self { idle_hours: 4.0 }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub home: PathBuf,
    pub database: PathBuf,
    pub queue_dir: PathBuf,
    pub staging_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub runtime_tag: String,
    pub scheduler: SchedulerSettings,
    pub transcription: TranscriptionSettings,
    pub categorization: CategorizationSettings,
    pub telegram: TelegramSettings,
    pub workers: WorkerSettings,
    pub watchdog: WatchdogSettings,
    pub maintenance: MaintenanceSettings,
    pub openai_api_key: Option<String>,
    pub telegram_bot_token: Option<String>,
}

/// Longest interval any duration setting may hold: one year.
const MAX_SETTING_MINUTES: i64 = 365 * 24 * 60;

fn check_minutes(name: &str, minutes: i64) -> Result<()> {
    if !(1..=MAX_SETTING_MINUTES).contains(&minutes) {
        bail!("{name} must be between 1 and {MAX_SETTING_MINUTES} minutes, got {minutes}");
    }
    Ok(())
}

fn check_seconds(name: &str, seconds: i64) -> Result<()> {
    if !(1..=MAX_SETTING_MINUTES * 60).contains(&seconds) {
        bail!("{name} must be between 1 and {} seconds, got {seconds}", MAX_SETTING_MINUTES * 60);
    }
    Ok(())
}

/// Check an idle threshold in hours; shared with `close-idle --hours`.
pub fn check_idle_hours(hours: f64) -> Result<()> {
    let max = (MAX_SETTING_MINUTES / 60) as f64;
    if !hours.is_finite() || hours <= 0.0 || hours > max {
        bail!("idle hours must be greater than 0 and at most {max}, got {hours}");
    }
    Ok(())
}

impl ResolvedConfig {
    /// Reject duration settings that are non-positive or out of range.
    pub fn validate(&self) -> Result<()> {
        check_minutes("scheduler.stale_lock_minutes", self.scheduler.stale_lock_minutes)?;
        check_minutes("transcription.quota_backoff_minutes", self.transcription.quota_backoff_minutes)?;
        check_seconds("transcription.retry_base_seconds", self.transcription.retry_base_seconds)?;
        check_seconds("transcription.retry_max_seconds", self.transcription.retry_max_seconds)?;
        check_minutes("categorization.quota_backoff_minutes", self.categorization.quota_backoff_minutes)?;
        check_minutes(
            "workers.queue_retention_hours",
            self.workers.queue_retention_hours.saturating_mul(60),
        )?;
        check_idle_hours(self.maintenance.idle_hours).context("maintenance.idle_hours")?;
        if self.scheduler.scan_window == 0 {
            bail!("scheduler.scan_window must be at least 1");
        }
        Ok(())
    }

    /// Defaults rooted at `home`, ignoring files and environment
    pub fn with_home(home: PathBuf) -> Self {
        Self {
            database: paths::database(&home),
            queue_dir: paths::queues(&home),
            staging_dir: paths::staging(&home),
            home,
            config_file: None,
            runtime_tag: crate::store::PROD_FAMILY.to_string(),
            scheduler: SchedulerSettings::default(),
            transcription: TranscriptionSettings::default(),
            categorization: CategorizationSettings::default(),
            telegram: TelegramSettings::default(),
            workers: WorkerSettings::default(),
            watchdog: WatchdogSettings::default(),
            maintenance: MaintenanceSettings::default(),
            openai_api_key: None,
            telegram_bot_token: None,
        }
    }
}

/// Find config file by searching a directory and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(paths::CONFIG_DIR).join(paths::CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Merge a parsed config file (if any) with the environment
fn resolve(config_path: Option<PathBuf>, file: ConfigFile) -> Result<ResolvedConfig> {
    let config_dir = config_path
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);

    let home = if let Some(env_home) = env_var("VOICEBOT_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(dir), Some(home)) = (config_dir.as_deref(), file.paths.home.as_deref()) {
        resolve_path(dir, home)
    } else {
        paths::default_home()?
    };

    let relative = |value: &Option<String>, fallback: PathBuf| match (config_dir.as_deref(), value) {
        (Some(dir), Some(p)) => resolve_path(dir, p),
        (None, Some(p)) => PathBuf::from(p),
        _ => fallback,
    };

    let runtime_tag = env_var("VOICEBOT_RUNTIME_TAG")
        .or(file.runtime_tag)
        .unwrap_or_else(|| crate::store::PROD_FAMILY.to_string());

    let config = ResolvedConfig {
        database: relative(&file.paths.database, paths::database(&home)),
        queue_dir: relative(&file.paths.queues, paths::queues(&home)),
        staging_dir: relative(&file.paths.staging, paths::staging(&home)),
        home,
        config_file: config_path,
        runtime_tag,
        scheduler: file.scheduler,
        transcription: file.transcription,
        categorization: file.categorization,
        telegram: file.telegram,
        workers: file.workers,
        watchdog: file.watchdog,
        maintenance: file.maintenance,
        openai_api_key: env_var("OPENAI_API_KEY"),
        telegram_bot_token: env_var("TELEGRAM_BOT_TOKEN"),
    };
    config.validate()?;
    Ok(config)
}

/// Load configuration from all sources.
///
/// An explicit `path` wins over discovery from the current directory.
pub fn load_config(path: Option<&Path>) -> Result<ResolvedConfig> {
    let config_path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => std::env::current_dir()
            .ok()
            .and_then(|dir| find_config_file(&dir)),
    };

    let file = match config_path.as_deref() {
        Some(p) => load_config_file(p)?,
        None => ConfigFile::default(),
    };

    resolve(config_path, file)
}
