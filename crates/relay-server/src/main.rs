//! relay-server: session-oriented screen and terminal relay.
//!
//! Controllers and targets connect over WebSocket, the relay pairs them into
//! sessions and forwards control and data traffic between them, shedding
//! data frames for consumers that fall behind.

mod config;
mod relay;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::RelayServer;
use std::path::PathBuf;
use tracing::{error, info};

/// relay-server: controller/target screen relay
#[derive(Parser, Debug)]
#[command(name = "relay-server", version, about = "Controller/target screen relay")]
struct Cli {
    /// Listen port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.screen-relay/config.toml")]
    config: String,

    /// Outstanding frames tolerated per link before dropping
    #[arg(long)]
    max_pending: Option<usize>,

    /// Seconds between statistics log lines (0 disables)
    #[arg(long)]
    stats_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting relay-server");

    let overrides = CliOverrides {
        host: cli.host.clone(),
        port: cli.port,
        max_pending: cli.max_pending,
        stats_interval_secs: cli.stats_interval,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if let Err(e) = RelayServer::new(server_config).run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("relay-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("received shutdown signal");
}
