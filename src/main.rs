//! SSE daemon.
//!
//! Serves a heartbeat event stream to every client that requests the
//! configured path.
//!
//! # Usage
//!
//! ```bash
//! # With config file
//! sse-session config/sse.toml
//!
//! # With environment variables
//! SSE_LISTEN_ADDR=0.0.0.0:8080 SSE_RETRY=3000 sse-session
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sse_session::{
    config::{Config, LoggingConfig},
    metrics::{init_metrics, start_metrics_server},
    server::{ConnectionHandler, SseListener},
    shutdown::ShutdownCoordinator,
};

/// Server-Sent Events daemon.
#[derive(Parser, Debug)]
#[command(name = "sse-session")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Override listen address.
    #[arg(short, long)]
    listen: Option<String>,

    /// Override the event stream path.
    #[arg(short, long)]
    path: Option<String>,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_ref())?;

    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(path) = args.path {
        config.server.path = path;
    }
    if args.debug {
        config.logging.level = "debug".to_string();
    }

    init_logging(&config.logging)?;

    let session = config.session.resolve();
    tracing::info!(
        listen_addr = %config.server.listen_addr,
        path = %config.server.path,
        retry = %session.retry,
        max_connections = config.server.max_connections,
        "Starting SSE daemon"
    );

    init_metrics();
    if config.metrics.enabled {
        let addr = config.metrics.listen_addr.parse()?;
        start_metrics_server(addr).await?;
    }

    let shutdown = ShutdownCoordinator::new();
    let listener = SseListener::bind(&config.server, shutdown.clone()).await?;

    tracing::info!(local_addr = %listener.local_addr(), "Daemon listening");

    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        handle_signals(shutdown_clone).await;
    });

    let handler = Arc::new(ConnectionHandler::new(config.server.clone(), session));

    while let Some(conn) = listener.accept().await {
        tracing::debug!(peer = %conn.peer_addr, id = conn.guard.id(), "Client connected");
        let handler = handler.clone();
        tokio::spawn(async move {
            handler.handle(conn.stream, conn.guard).await;
        });
    }
    tracing::info!("Accept loop terminated");

    tracing::info!(
        active = shutdown.active_connections(),
        timeout_secs = config.server.shutdown_timeout_secs,
        "Waiting for connections to drain"
    );

    match tokio::time::timeout(config.server.shutdown_timeout(), shutdown.wait_for_drain()).await {
        Ok(()) => tracing::info!("All connections drained"),
        Err(_) => tracing::warn!(
            active = shutdown.active_connections(),
            "Shutdown timeout reached, forcing exit"
        ),
    }

    tracing::info!("Daemon stopped");
    Ok(())
}

/// Initialize logging with tracing.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }

    Ok(())
}

/// Handle Unix signals.
async fn handle_signals(shutdown: ShutdownCoordinator) {
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to register SIGINT");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM");
    let mut sighup = signal(SignalKind::hangup()).expect("Failed to register SIGHUP");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating shutdown");
                shutdown.shutdown();
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown");
                shutdown.shutdown();
                break;
            }
            _ = sighup.recv() => {
                tracing::info!(
                    active_connections = shutdown.active_connections(),
                    "Received SIGHUP, status report"
                );
            }
        }
    }
}
