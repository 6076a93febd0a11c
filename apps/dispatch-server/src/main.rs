//! dispatch-server - standalone ingest and query server for a trunked-radio
//! recorder fleet.
//!
//! This binary wires the composition root in `dispatch-core::bootstrap` to a
//! concrete configuration source (YAML + environment) and an HTTP listener,
//! then waits for a shutdown signal and runs the ordered drain sequence.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dispatch_core::{bootstrap, ApiState, AuthConfig};
use tokio::signal;
use tokio::sync::Notify;

use crate::config::ServerConfig;

/// dispatch-server - ingest, state management, and query API for a
/// trunked-radio recorder fleet.
#[derive(Parser, Debug)]
#[command(name = "dispatch-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE", env = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "LOG_LEVEL")]
    log_level: log::LevelFilter,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("dispatch-server v{}", env!("CARGO_PKG_VERSION"));

    let config =
        ServerConfig::load(args.config.as_deref()).context("failed to load configuration")?;

    let addr = config
        .http_socket_addr()
        .context("failed to resolve HTTP_ADDR")?;
    let engine_config = config.to_engine_config();

    let engine = Arc::new(
        bootstrap(engine_config)
            .await
            .context("failed to bootstrap engine")?,
    );

    log::info!("engine bootstrapped successfully");

    let api_state = ApiState {
        engine: engine.clone(),
        auth: AuthConfig {
            enabled: config.auth_enabled,
            token: config.auth_token.clone(),
        },
    };

    let shutdown_notify = Arc::new(Notify::new());
    let shutdown_wait = {
        let notify = shutdown_notify.clone();
        async move { notify.notified().await }
    };

    let server = tokio::spawn(dispatch_core::start_server(api_state, addr, shutdown_wait));

    log::info!("http api listening on {addr}");

    shutdown_signal().await;
    log::info!("shutdown signal received, draining");
    shutdown_notify.notify_one();

    if let Err(e) = server.await.context("server task panicked")? {
        log::error!("http server error: {e}");
    }

    match Arc::try_unwrap(engine) {
        Ok(engine) => engine.shutdown().await,
        Err(_) => log::warn!("shutdown: engine still has live references, skipping ordered drain"),
    }

    log::info!("shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
