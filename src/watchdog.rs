//! Dependency watchdog.
//!
//! Health-checks a cooperating service over HTTP and, when allowed, runs
//! its restart command and checks again.

use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

/// Errors that prevent the watchdog from running at all
#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("No health_url configured")]
    MissingHealthUrl,

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Watchdog settings
#[derive(Debug, Clone)]
pub struct WatchdogOptions {
    pub health_url: String,
    /// Program and arguments
    pub restart_command: Vec<String>,
    pub timeout: Duration,
    /// Wait after a restart before checking again
    pub settle: Duration,
}

impl WatchdogOptions {
    pub fn from_config(config: &crate::config::WatchdogSettings) -> Result<Self, WatchdogError> {
        Ok(Self {
            health_url: config.health_url.clone().ok_or(WatchdogError::MissingHealthUrl)?,
            restart_command: config.restart_command.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
            settle: Duration::from_secs(config.settle_seconds),
        })
    }
}

/// One health check
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub url: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

/// Outcome of one watchdog run
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogReport {
    pub initial: HealthCheck,
    pub restarted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recheck: Option<HealthCheck>,
    /// Service healthy at the end of the run
    pub healthy: bool,
}

/// Check `url`; any 2xx answer is healthy.
pub async fn check_health(client: &reqwest::Client, url: &str) -> HealthCheck {
    let started = Instant::now();
    let (status, error) = match client.get(url).send().await {
        Ok(response) => (Some(response.status().as_u16()), None),
        Err(e) => (None, Some(e.to_string())),
    };
    HealthCheck {
        url: url.to_string(),
        healthy: status.map(|s| (200..300).contains(&s)).unwrap_or(false),
        status,
        error,
        latency_ms: started.elapsed().as_millis() as u64,
    }
}

async fn restart(command: &[String]) -> Result<(), String> {
    let Some((program, args)) = command.split_first() else {
        return Err("no restart_command configured".to_string());
    };
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| format!("failed to run {}: {}", program, e))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

/// Check health; with `apply`, restart an unhealthy service and recheck.
pub async fn run_watchdog(options: &WatchdogOptions, apply: bool) -> Result<WatchdogReport, WatchdogError> {
    let client = reqwest::Client::builder().timeout(options.timeout).build()?;

    let initial = check_health(&client, &options.health_url).await;
    if initial.healthy {
        info!(url = %options.health_url, status = ?initial.status, "service healthy");
        return Ok(WatchdogReport {
            initial,
            restarted: false,
            restart_error: None,
            recheck: None,
            healthy: true,
        });
    }

    warn!(url = %options.health_url, status = ?initial.status, error = ?initial.error, "service unhealthy");
    if !apply {
        return Ok(WatchdogReport {
            initial,
            restarted: false,
            restart_error: None,
            recheck: None,
            healthy: false,
        });
    }

    if let Err(e) = restart(&options.restart_command).await {
        warn!(error = %e, "restart failed");
        return Ok(WatchdogReport {
            initial,
            restarted: false,
            restart_error: Some(e),
            recheck: None,
            healthy: false,
        });
    }

    info!(command = ?options.restart_command, "restarted service");
    tokio::time::sleep(options.settle).await;

    let recheck = check_health(&client, &options.health_url).await;
    let healthy = recheck.healthy;
    Ok(WatchdogReport {
        initial,
        restarted: true,
        restart_error: None,
        recheck: Some(recheck),
        healthy,
    })
}
