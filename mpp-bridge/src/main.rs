//! Event Bridge (mpp-bridge) - Main entry point
//!
//! Webhook in, filtered SSE push out. Keeps no durable state of its
//! own; everything durable lives behind the ingestor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mpp_bridge::registry::ConnectionRegistry;
use mpp_bridge::{build_router, AppState};

/// Command-line arguments for mpp-bridge
#[derive(Parser, Debug)]
#[command(name = "mpp-bridge")]
#[command(about = "Event bridge and fan-out router for the mastery progress pipeline")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "5761", env = "MPP_BRIDGE_PORT")]
    port: u16,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "30", env = "MPP_BRIDGE_HEARTBEAT_SECS")]
    heartbeat_secs: u64,

    /// Per-connection outbound buffer, in frames
    #[arg(long, default_value = "64", env = "MPP_BRIDGE_BUFFER")]
    buffer: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mpp_bridge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting MPP Event Bridge on port {}", args.port);

    let registry = Arc::new(ConnectionRegistry::new(args.buffer));

    // Heartbeat task: pings every open connection and reaps the ones
    // that have gone quiet for three intervals
    {
        let registry = registry.clone();
        let interval = Duration::from_secs(args.heartbeat_secs);
        let stale_after = chrono::Duration::seconds((args.heartbeat_secs * 3) as i64);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                match registry.heartbeat_sweep(stale_after) {
                    Ok(0) => {}
                    Ok(closed) => info!("Heartbeat sweep closed {} connection(s)", closed),
                    Err(e) => warn!("Heartbeat sweep failed: {}", e),
                }
            }
        });
    }

    let app = build_router(AppState { registry });

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
