//! Maintenance CLI commands.
//!
//! - `voicebot maintenance close-idle` - Close sessions with no recent activity
//! - `voicebot maintenance dedupe-webm` - Soft-delete duplicate WebM uploads
//! - `voicebot maintenance backfill-runtime-tag` - Tag legacy records as prod
//! - `voicebot maintenance watchdog` - Health-check and restart a dependency
//!
//! All commands are dry runs unless `--apply` is given. The exit code is
//! non-zero while candidates or failures remain, so the commands can run
//! under cron or a monitor.

use std::process::ExitCode;

use anyhow::Result;
use chrono::Utc;
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::app::App;
use crate::config::ResolvedConfig;
use crate::maintenance::{
    backfill_runtime_tag, close_idle, dedupe_webm, BackfillReport, CloseIdleReport, DedupeReport,
    MaintenanceOptions,
};
use crate::watchdog::{run_watchdog, WatchdogOptions, WatchdogReport};

/// Flags shared by every maintenance command
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Make changes (default is a dry run)
    #[arg(long)]
    pub apply: bool,

    /// Print the report as one JSON document
    #[arg(long, conflicts_with = "jsonl")]
    pub json: bool,

    /// Print one JSON line per item, then a summary line
    #[arg(long)]
    pub jsonl: bool,

    /// Maximum number of items to handle
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Restrict to one session
    #[arg(long)]
    pub session: Option<String>,
}

impl CommonArgs {
    fn options(&self) -> MaintenanceOptions {
        MaintenanceOptions {
            apply: self.apply,
            limit: self.limit,
            session_id: self.session.clone(),
        }
    }

    fn format(&self) -> Format {
        if self.json {
            Format::Json
        } else if self.jsonl {
            Format::Jsonl
        } else {
            Format::Text
        }
    }
}

/// Maintenance subcommands
#[derive(Subcommand, Debug)]
pub enum MaintenanceCommands {
    /// Close sessions idle for longer than a threshold
    CloseIdle {
        /// Idle threshold in hours (defaults to maintenance.idle_hours)
        #[arg(long)]
        hours: Option<f64>,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Soft-delete duplicate WebM messages within a session
    DedupeWebm {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Tag records without a runtime tag as prod (prod runtime only)
    BackfillRuntimeTag {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Check a dependency's health endpoint and restart it when down
    Watchdog {
        /// Health URL (defaults to watchdog.health_url)
        #[arg(long)]
        url: Option<String>,

        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Text,
    Json,
    Jsonl,
}

/// Execute a maintenance subcommand
pub async fn execute(config: ResolvedConfig, command: MaintenanceCommands) -> Result<ExitCode> {
    let unresolved = match command {
        MaintenanceCommands::CloseIdle { hours, common } => {
            let hours = hours.unwrap_or(config.maintenance.idle_hours);
            let app = App::open(config)?;
            let report = close_idle(&app.repo, &app.side_effects(), hours, Utc::now(), &common.options()).await?;
            print_close_idle(&report, common.format())?;
            report.unresolved()
        }
        MaintenanceCommands::DedupeWebm { common } => {
            let app = App::open(config)?;
            let report = dedupe_webm(&app.repo, Utc::now(), &common.options()).await?;
            print_dedupe(&report, common.format())?;
            report.unresolved()
        }
        MaintenanceCommands::BackfillRuntimeTag { common } => {
            let app = App::open(config)?;
            let report = backfill_runtime_tag(&app.repo, &common.options()).await?;
            print_backfill(&report, common.format())?;
            report.unresolved()
        }
        MaintenanceCommands::Watchdog { url, common } => {
            let mut settings = config.watchdog.clone();
            if url.is_some() {
                settings.health_url = url;
            }
            let options = WatchdogOptions::from_config(&settings)?;
            let report = run_watchdog(&options, common.apply).await?;
            print_watchdog(&report, common.format())?;
            !report.healthy
        }
    };

    Ok(if unresolved { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_lines<I, T, S>(items: I, summary: &S) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Serialize,
    S: Serialize,
{
    for item in items {
        println!("{}", serde_json::to_string(&item)?);
    }
    println!("{}", serde_json::to_string(summary)?);
    Ok(())
}

fn mode(apply: bool) -> &'static str {
    if apply {
        "apply"
    } else {
        "dry run"
    }
}

fn print_close_idle(report: &CloseIdleReport, format: Format) -> Result<()> {
    match format {
        Format::Json => print_json(report),
        Format::Jsonl => print_lines(
            &report.candidates,
            &serde_json::json!({
                "summary": true,
                "apply": report.apply,
                "candidates": report.candidates.len(),
                "closed": report.closed.len(),
                "failed": report.failed,
            }),
        ),
        Format::Text => {
            println!("Idle sessions (>= {}h, {}): {}", report.threshold_hours, mode(report.apply), report.candidates.len());
            for idle in &report.candidates {
                println!(
                    "  {}  idle {:.1}h  last activity {}{}",
                    idle.session_id,
                    idle.idle_hours,
                    idle.last_activity.to_rfc3339(),
                    idle.session_name.as_deref().map(|n| format!("  ({})", n)).unwrap_or_default()
                );
            }
            if report.apply {
                println!("Closed: {}", report.closed.len());
            }
            for failure in &report.failed {
                println!("  FAILED {}: {}", failure.id, failure.error);
            }
            Ok(())
        }
    }
}

fn print_dedupe(report: &DedupeReport, format: Format) -> Result<()> {
    match format {
        Format::Json => print_json(report),
        Format::Jsonl => print_lines(
            &report.groups,
            &serde_json::json!({
                "summary": true,
                "apply": report.apply,
                "groups": report.groups.len(),
                "soft_deleted": report.soft_deleted,
                "failed": report.failed,
            }),
        ),
        Format::Text => {
            println!("Duplicate WebM groups ({}): {}", mode(report.apply), report.groups.len());
            for group in &report.groups {
                println!(
                    "  session {}  keep {}  drop {}  [{}]",
                    group.session_id,
                    group.canonical,
                    group.duplicates.join(", "),
                    group.key
                );
            }
            if report.apply {
                println!("Soft-deleted: {}", report.soft_deleted);
            }
            for failure in &report.failed {
                println!("  FAILED {}: {}", failure.id, failure.error);
            }
            Ok(())
        }
    }
}

fn print_backfill(report: &BackfillReport, format: Format) -> Result<()> {
    match format {
        Format::Json => print_json(report),
        Format::Jsonl => print_lines(
            &report.collections,
            &serde_json::json!({ "summary": true, "apply": report.apply }),
        ),
        Format::Text => {
            println!("Runtime tag backfill ({}):", mode(report.apply));
            println!("{:<16} {:>10} {:>10}", "COLLECTION", "UNTAGGED", "TAGGED");
            for count in &report.collections {
                println!("{:<16} {:>10} {:>10}", count.collection, count.untagged, count.tagged);
            }
            Ok(())
        }
    }
}

fn print_watchdog(report: &WatchdogReport, format: Format) -> Result<()> {
    match format {
        Format::Json | Format::Jsonl => {
            println!("{}", serde_json::to_string(report)?);
            Ok(())
        }
        Format::Text => {
            let status = |check: &crate::watchdog::HealthCheck| {
                check
                    .status
                    .map(|s| s.to_string())
                    .or_else(|| check.error.clone())
                    .unwrap_or_default()
            };
            println!(
                "{}: {} ({}, {}ms)",
                report.initial.url,
                if report.initial.healthy { "healthy" } else { "unhealthy" },
                status(&report.initial),
                report.initial.latency_ms
            );
            if let Some(error) = &report.restart_error {
                println!("Restart failed: {}", error);
            }
            if let Some(recheck) = &report.recheck {
                println!(
                    "After restart: {} ({})",
                    if recheck.healthy { "healthy" } else { "unhealthy" },
                    status(recheck)
                );
            }
            Ok(())
        }
    }
}
