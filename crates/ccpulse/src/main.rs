//! ccpulse - Real-time Claude usage monitor

mod cli;

use anyhow::{Context, Result};
use ccpulse_core::{JsonlSource, MonitorConfig, MonitorEvent, MonitoringOrchestrator, Plan};
use clap::Parser;
use cli::OutputFormat;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "ccpulse",
    version,
    about = "Real-time Claude usage monitor",
    long_about = "Watches Claude transcript files, groups usage into 5-hour session windows,\n\
                  and reports token consumption, burn rate and projected usage against\n\
                  your plan's limit.\n\
                  \n\
                  Examples:\n\
                    ccpulse                          # Stream one JSON snapshot per cycle\n\
                    ccpulse --format summary         # One status line per cycle\n\
                    ccpulse --once                   # Single snapshot, then exit\n\
                    ccpulse --plan max5              # Use the Max 5x limits\n\
                  \n\
                  Environment Variables:\n\
                    CCPULSE_DATA_DIR                 # Transcript directory (default: ~/.claude/projects)\n\
                    CCPULSE_CONFIG                   # Config file path\n\
                    CCPULSE_PLAN                     # pro | max5 | max20 | custom\n\
                    RUST_LOG                         # Log filter (default: ccpulse=info)"
)]
struct Cli {
    /// Directory containing transcript *.jsonl files
    #[arg(long, env = "CCPULSE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Config file (default: <config dir>/ccpulse/config.toml)
    #[arg(long, env = "CCPULSE_CONFIG")]
    config: Option<PathBuf>,

    /// Plan whose limits apply
    #[arg(long, env = "CCPULSE_PLAN")]
    plan: Option<Plan>,

    /// Explicit token limit for the custom plan
    #[arg(long)]
    custom_limit_tokens: Option<u64>,

    /// Seconds between monitoring cycles
    #[arg(long)]
    interval: Option<u64>,

    /// Only read entries from the last N hours
    #[arg(long)]
    hours_back: Option<u32>,

    /// Print one snapshot and exit
    #[arg(long)]
    once: bool,

    #[arg(long, value_enum, default_value = "json")]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    /// Config file with CLI flags applied on top
    fn load_config(&self) -> Result<MonitorConfig> {
        let mut config = match self.config.clone().or_else(MonitorConfig::default_path) {
            Some(path) => MonitorConfig::load_or_default(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => MonitorConfig::default(),
        };

        if let Some(plan) = self.plan {
            config.plan = plan;
        }
        if self.custom_limit_tokens.is_some() {
            config.custom_limit_tokens = self.custom_limit_tokens;
        }
        if let Some(interval) = self.interval {
            config.update_interval_secs = interval;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn setup_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("ccpulse=debug,ccpulse_core=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("ccpulse=info,ccpulse_core=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.debug);

    let config = cli.load_config()?;
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(JsonlSource::default_root)
        .context("Could not determine Claude projects directory")?;
    let source = JsonlSource::new(&data_dir).with_hours_back(cli.hours_back);

    info!(data_dir = %data_dir.display(), plan = %config.plan, "Starting ccpulse");
    let orchestrator =
        MonitoringOrchestrator::new(config, source).context("Failed to create monitor")?;

    if cli.once {
        let snapshot = orchestrator
            .force_refresh()
            .context("No usage data available")?;
        println!("{}", cli::render(&snapshot, cli.format)?);
        return Ok(());
    }

    let mut events = orchestrator.subscribe();
    orchestrator.start().context("Failed to start monitoring")?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(MonitorEvent::SnapshotReady(snapshot)) => {
                    println!("{}", cli::render(&snapshot, cli.format)?);
                }
                Ok(MonitorEvent::SessionStarted(id)) => info!(session_id = %id, "Session started"),
                Ok(MonitorEvent::SessionEnded(id)) => info!(session_id = %id, "Session ended"),
                Ok(MonitorEvent::CycleSkipped(reason)) => warn!(?reason, "Cycle skipped"),
                Err(RecvError::Lagged(missed)) => warn!(missed, "Dropped monitor events"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    tokio::task::block_in_place(|| orchestrator.stop()).context("Failed to stop monitoring")?;
    Ok(())
}
