//! conductor daemon: runs the coordinator, the HTTP API and the PR poller.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use cn_core::config::Config;
use cn_daemon::daemon::Daemon;
use cn_telemetry::logging::{self, LogFormat};
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let format: LogFormat = config
        .general
        .log_format
        .parse()
        .map_err(anyhow::Error::msg)?;
    logging::init("conductor", &config.general.log_level, format);
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "conductor starting");

    let daemon = Daemon::new(config);
    let shutdown = daemon.shutdown_handle();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}

/// conductor -- schedule coding agents across local workspaces and carry
/// their branches through CI and review.
#[derive(Debug, Parser)]
#[command(name = "conductor", version, about)]
struct Cli {
    /// Config file to use instead of `~/.conductor/config.toml`.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(p) => Config::load_from(p).with_context(|| format!("failed to load {}", p.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    Ok(config)
}
