//! # huddle
//!
//! Runs the session state and messaging backplane against Redis, logs its
//! health periodically and shuts down cleanly on SIGINT/SIGTERM.

#![deny(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use huddle_core::load_settings;
use huddle_store::{shutdown_signal, Backplane};
use huddle_telemetry::{init_telemetry, TelemetryConfig};

/// Session state and messaging backplane.
#[derive(Parser, Debug)]
#[command(name = "huddle", about = "Session state and messaging backplane")]
struct Cli {
    /// Redis URL (overrides `HUDDLE_REDIS_URL`).
    #[arg(long)]
    redis_url: Option<String>,

    /// Log level (overrides `HUDDLE_LOG_LEVEL`).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    /// Seconds to wait for the first connection before serving from fallback.
    #[arg(long, default_value = "10")]
    ready_timeout_secs: u64,

    /// Seconds between health log lines (0 disables).
    #[arg(long, default_value = "30")]
    health_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings().context("Failed to load settings")?;
    if let Some(url) = cli.redis_url {
        settings.redis_url = url;
    }
    if let Some(level) = cli.log_level {
        settings.log_level = level;
    }
    settings.log_json |= cli.json_logs;
    settings.validate().context("Invalid settings")?;

    let telemetry = init_telemetry(
        TelemetryConfig::from_level_str(&settings.log_level, settings.log_json)
            .with_module_levels(&settings.log_modules),
    );

    let backplane = Backplane::connect_redis(&settings, telemetry.metrics())
        .context("Failed to configure Redis connector")?;
    let state = backplane
        .wait_ready(Duration::from_secs(cli.ready_timeout_secs))
        .await;
    tracing::info!(state = state.as_str(), "huddle backplane ready");
    log_health(&backplane).await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    if cli.health_interval_secs == 0 {
        shutdown.await;
    } else {
        let mut ticker = tokio::time::interval(Duration::from_secs(cli.health_interval_secs));
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = ticker.tick() => log_health(&backplane).await,
            }
        }
    }

    tracing::info!("Shutting down...");
    backplane.shutdown();
    let metrics = serde_json::to_string(&telemetry.metrics().snapshot())
        .context("Failed to encode metrics")?;
    tracing::info!(metrics = %metrics, "Shutdown complete");
    Ok(())
}

async fn log_health(backplane: &Backplane) {
    let report = backplane.health_check().await;
    match serde_json::to_string(&report) {
        Ok(json) => tracing::info!(health = %json, "health check"),
        Err(e) => tracing::warn!(error = %e, "health report not serializable"),
    }
}
