//! # relay
//!
//! Gateway binary: resolves settings, installs logging and metrics, serves
//! WebSocket clients until SIGINT/SIGTERM, then drains gracefully.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use relay_gateway::{Gateway, GatewayConfig, GatewayServer};
use relay_settings::{LogFormat, LogLevel, RelaySettings};

/// Relay WebSocket gateway.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Real-time WebSocket connection gateway")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (overrides settings; `RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Log format: `text` or `json`.
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Maximum concurrent connections (overrides settings).
    #[arg(long)]
    max_connections: Option<usize>,
}

/// Load the settings file and layer CLI flags on top.
fn resolve_settings(cli: &Cli) -> Result<RelaySettings> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(relay_settings::settings_path);
    let mut settings = relay_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;

    if let Some(host) = &cli.host {
        settings.server.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(level) = &cli.log_level {
        settings.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        settings.logging.format = format;
    }
    if let Some(max) = cli.max_connections {
        settings.gateway.max_connections = max;
    }
    settings
        .gateway
        .validate()
        .context("Invalid gateway settings")?;
    Ok(settings)
}

/// Resolve on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = resolve_settings(&cli)?;

    relay_logging::init_subscriber(&settings.logging.level, settings.logging.format);

    let metrics = relay_gateway::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;
    let config =
        GatewayConfig::from_settings(&settings.gateway).context("Invalid gateway settings")?;
    let gateway = Gateway::new(config).context("Failed to start gateway")?;

    let server = GatewayServer::new(gateway.clone(), &settings.server.host, settings.server.port)
        .with_metrics(metrics);
    let (addr, handle) = server.listen().await.context("Failed to start server")?;
    tracing::info!(%addr, name = %settings.name, version = %settings.version, "relay ready");

    shutdown_signal().await?;
    tracing::info!("Shutting down...");

    gateway.shutdown().await;
    handle.await.context("Server task panicked")?;
    Ok(())
}
