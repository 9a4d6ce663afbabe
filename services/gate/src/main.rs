//! linegate gateway binary.
//!
//! Loads the TOML configuration, builds every configured tunnel engine,
//! starts them and runs until Ctrl-C or SIGTERM. Shutdown stops every engine
//! with a bounded grace period; sessions still alive after it make the
//! process exit with status 1.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use linegate_gate::config::{GateConfig, DEFAULT_CONFIG_PATH};
use linegate_gate::{logging, GateContext, ProxyRegistry};

/// Gateway reverse proxy.
#[derive(Debug, Parser)]
#[command(name = "gate", version, about)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, env = "GATE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = GateConfig::load(&cli.config)?;

    let log_guard = logging::init(&config.options)?;

    info!("Starting linegate gateway");
    info!(
        config = %cli.config.display(),
        log_dir = ?log_guard.dir(),
        proxy_count = config.proxies.len(),
        redirect = config.options.redirect,
        "Configuration loaded"
    );

    let ctx = GateContext::new();
    let registry = ProxyRegistry::from_config(&config, ctx.clone()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reporter = tokio::spawn(
        Arc::clone(ctx.stats()).run_reporter(config.options.stats_interval(), shutdown_rx),
    );

    if let Err(e) = registry.start_all().await {
        error!(error = %e, "Startup failed");
        let _ = registry.stop_all(config.options.stop_timeout()).await;
        return Err(e.into());
    }

    shutdown_signal().await;
    info!("Received shutdown signal");

    let stopped = registry.stop_all(config.options.stop_timeout()).await;

    let _ = shutdown_tx.send(true);
    let _ = reporter.await;

    match stopped {
        Ok(()) => {
            info!("Gateway shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Gateway did not drain in time, forcing exit");
            drop(log_guard);
            std::process::exit(1);
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
