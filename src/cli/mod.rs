//! Command-line interface for voicebot.
//!
//! Runs the scheduler and workers, triggers single reconciliation passes
//! and transcriptions, and hosts the maintenance commands.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::app::App;
use crate::config::{self, ResolvedConfig};
use crate::domain::{QueueName, TranscribePayload};
use crate::queue::JobQueue;
use crate::reconcile::{PassOptions, Scheduler};
use crate::transcription::mask_secret;

pub mod maintenance;

/// voicebot - voice session pipeline: transcription, categorization, finalization
#[derive(Parser, Debug)]
#[command(name = "voicebot")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to .voicebot/config.yaml found from the current directory)
    #[arg(long, global = true, env = "VOICEBOT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the reconciliation scheduler and queue workers until Ctrl+C
    Serve {
        /// Run workers only, without the scheduler
        #[arg(long)]
        no_scheduler: bool,
    },

    /// Run one reconciliation pass now
    Reconcile {
        /// Sessions to finalize in this pass
        #[arg(short, long)]
        limit: Option<usize>,

        /// Print the pass result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Transcribe one message now, bypassing the queue
    Transcribe {
        /// Message record id
        message_db_id: String,
    },

    /// Show queue status
    Status,

    /// Show resolved configuration (debug)
    Config,

    /// Repair and monitoring commands
    Maintenance {
        #[command(subcommand)]
        command: maintenance::MaintenanceCommands,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<ExitCode> {
        let config = config::load_config(self.config.as_deref())?;

        match self.command {
            Commands::Serve { no_scheduler } => serve(config, !no_scheduler).await,
            Commands::Reconcile { limit, json } => reconcile_once(config, limit, json).await,
            Commands::Transcribe { message_db_id } => transcribe_one(config, &message_db_id).await,
            Commands::Status => show_status(config).await,
            Commands::Config => show_config(&config),
            Commands::Maintenance { command } => maintenance::execute(config, command).await,
        }
    }
}

/// Run scheduler and workers until interrupted
async fn serve(config: ResolvedConfig, with_scheduler: bool) -> Result<ExitCode> {
    let app = App::open(config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if with_scheduler {
        let interval = Duration::from_secs(app.config.scheduler.interval_seconds.max(1));
        let scheduler = Arc::new(Scheduler::new(Arc::new(app.reconciler()), interval));
        tasks.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));
    }

    let worker = Arc::new(app.worker()?);
    let workers = &app.config.workers;
    for (queue, concurrency) in [
        (QueueName::Voice, workers.transcribe_concurrency),
        (QueueName::Processors, workers.processors_concurrency),
        (QueueName::Events, workers.events_concurrency),
    ] {
        tasks.push(tokio::spawn(Arc::clone(&worker).run(queue, concurrency, shutdown_rx.clone())));
    }

    info!(runtime_tag = %app.config.runtime_tag, "voicebot running, Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("shutting down");
    shutdown_tx.send_replace(true);
    for task in tasks {
        task.await.context("Background task panicked")?;
    }

    Ok(ExitCode::SUCCESS)
}

/// Run a single pass and report its counts
async fn reconcile_once(config: ResolvedConfig, limit: Option<usize>, json: bool) -> Result<ExitCode> {
    let app = App::open(config)?;
    let result = app
        .reconciler()
        .run_reconciliation_pass(PassOptions { limit })
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("Reconciliation pass: {}", if result.ok { "ok" } else { "failed" });
        println!("  Unblocked sessions:         {}", result.unblocked_sessions);
        println!("  Requeued transcriptions:    {}", result.requeued_transcriptions);
        println!("  Reset categorization locks: {}", result.reset_categorization_locks);
        println!("  Requeued categorizations:   {}", result.requeued_categorizations);
        println!("  Categorized sessions:       {}", result.categorized_sessions);
        println!("  Finalized sessions:         {}", result.finalized_sessions);
        if let Some(error) = &result.error {
            println!("  Error: {}", error);
        }
    }

    Ok(if result.ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Run the transcription handler inline for one message
async fn transcribe_one(config: ResolvedConfig, message_db_id: &str) -> Result<ExitCode> {
    let app = App::open(config)?;
    let message = app
        .repo
        .get_message(message_db_id)
        .await?
        .with_context(|| format!("Message not found: {}", message_db_id))?;

    let payload = TranscribePayload {
        message_id: message.message_id.clone(),
        message_db_id: message.id.clone(),
        session_id: message.session_id.clone(),
        chat_id: message.chat_id,
        job_id: format!("manual-{}", Uuid::new_v4()),
    };
    let outcome = app.transcription_worker()?.handle_transcribe_job(&payload).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    Ok(if outcome.ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Show job counts per queue
async fn show_status(config: ResolvedConfig) -> Result<ExitCode> {
    let app = App::open(config)?;

    println!("{:<12} {:>8} {:>8} {:>10} {:>8}", "QUEUE", "WAITING", "ACTIVE", "COMPLETED", "FAILED");
    println!("{}", "-".repeat(50));
    for queue in QueueName::ALL {
        let status = app.queue.status(queue).await?;
        println!(
            "{:<12} {:>8} {:>8} {:>10} {:>8}",
            queue.as_str(),
            status.waiting,
            status.active,
            status.completed,
            status.failed
        );
    }

    Ok(ExitCode::SUCCESS)
}

/// Show resolved configuration
fn show_config(cfg: &ResolvedConfig) -> Result<ExitCode> {
    let masked = |value: &Option<String>| {
        value
            .as_deref()
            .map(mask_secret)
            .unwrap_or_else(|| "(not set)".to_string())
    };

    println!("╔═══════════════════════════════════════════════════════════════╗");
    println!("  Voicebot Configuration");
    println!("╚═══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Config file: {}", cfg.config_file.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(none - using defaults)".to_string()));
    println!("Runtime tag: {}", cfg.runtime_tag);
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Database: {}", cfg.database.display());
    println!("  Queues:   {}", cfg.queue_dir.display());
    println!("  Staging:  {}", cfg.staging_dir.display());
    println!();
    println!("Scheduler:");
    println!("  Interval:       {}s", cfg.scheduler.interval_seconds);
    println!("  Finalize limit: {}", cfg.scheduler.finalize_limit);
    println!("  Scan window:    {}", cfg.scheduler.scan_window);
    println!("  Stale lock:     {}m", cfg.scheduler.stale_lock_minutes);
    println!();
    println!("Transcription:");
    println!("  Provider:      {:?}", cfg.transcription.provider);
    println!("  Model:         {}", cfg.transcription.model);
    println!("  Base URL:      {}", cfg.transcription.base_url);
    println!("  Max attempts:  {}", cfg.transcription.max_attempts);
    println!("  Quota backoff: {}m", cfg.transcription.quota_backoff_minutes);
    println!();
    println!("Credentials:");
    println!("  OpenAI API key:     {}", masked(&cfg.openai_api_key));
    println!("  Telegram bot token: {}", masked(&cfg.telegram_bot_token));
    println!();
    println!("Watchdog:");
    println!("  Health URL: {}", cfg.watchdog.health_url.as_deref().unwrap_or("(not set)"));

    Ok(ExitCode::SUCCESS)
}
