// berthd - container lifecycle daemon

use anyhow::{Context, Result};
use berth::config::DaemonConfig;
use berth::daemon::{Daemon, PidFile};
use clap::Parser;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

/// Restart and lifecycle daemon for local containers
#[derive(Parser, Debug)]
#[command(name = "berthd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (.toml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep containers running while the daemon is down
    #[arg(long)]
    live_restore: bool,

    /// Directory for persisted container state
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// PID file of the daemon
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn load_config(&self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => DaemonConfig::default(),
        };

        if self.live_restore {
            config.live_restore = true;
        }
        if let Some(state_dir) = &self.state_dir {
            config.state_dir = state_dir.clone();
        }
        if let Some(pid_file) = &self.pid_file {
            config.pid_file = pid_file.clone();
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves once SIGTERM or SIGINT arrives
async fn shutdown_signal() -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to set up SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to set up SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = args.load_config()?;
    let _pid_file = PidFile::acquire(&config.pid_file).context("failed to write PID file")?;

    let daemon = Daemon::start(config).await.context("failed to start daemon")?;
    let report = daemon.report();
    if !report.dead.is_empty() {
        warn!("{} containers could not be reconciled", report.dead.len());
    }

    let started = daemon.start_declared().await;
    if !started.is_empty() {
        info!("Started {} declared containers", started.len());
    }

    shutdown_signal().await?;
    daemon.shutdown().await;
    Ok(())
}
