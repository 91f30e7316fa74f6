//! # tether-agent
//!
//! Relay binary: loads `.env` and settings, starts the server, and shuts it
//! down gracefully on Ctrl-C or SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tether_auth::HttpAuthResolver;
use tether_core::logging;
use tether_server::{ServerConfig, ServerHandle, TetherServer};
use tether_settings::TetherSettings;

/// WebSocket relay between development tools and devices.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "WebSocket relay between tools and devices")]
struct Cli {
    /// JSON settings file, merged over the defaults.
    #[arg(long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Base URL of the account service.
    #[arg(long)]
    auth_url: Option<String>,

    /// Log filter, e.g. `info` or `tether_server=debug`.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Flags win over the settings file and environment.
    fn apply(&self, settings: &mut TetherSettings) {
        if let Some(ref host) = self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(ref url) = self.auth_url {
            settings.auth.base_url = Some(url.trim_end_matches('/').to_string());
        }
        if let Some(ref level) = self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

fn load<F>(cli: &Cli, env: F) -> Result<TetherSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let mut settings = tether_settings::load_settings_with(cli.config.as_deref(), env)
        .context("Failed to load settings")?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

async fn start(settings: &TetherSettings) -> Result<ServerHandle> {
    let base_url = settings
        .auth
        .base_url
        .as_deref()
        .context("auth.baseUrl is not set")?;
    let resolver = HttpAuthResolver::new(base_url, settings.auth.timeout())
        .context("Failed to build auth client")?;

    let mut server = TetherServer::new(ServerConfig::from(settings), Arc::new(resolver));
    match tether_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        // Already installed in this process (tests)
        Err(e) => tracing::warn!(error = %e, "metrics recorder unavailable"),
    }

    let handle = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        addr = %handle.local_addr(),
        auth_url = base_url,
        max_devices = settings.limits.max_devices_per_account,
        "tether relay listening"
    );
    Ok(handle)
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
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
    // A missing .env is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let settings = load(&cli, |key| std::env::var(key).ok())?;
    logging::init_subscriber(&settings.logging.level, settings.logging.format);

    let handle = start(&settings).await?;

    shutdown_signal().await?;
    tracing::info!("Shutting down...");
    handle.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
