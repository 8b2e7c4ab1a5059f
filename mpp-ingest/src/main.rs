//! Ingestor (mpp-ingest) - Main entry point
//!
//! HTTP service wrapping the idempotent ingest engine: activity events
//! in, committed score state and bridge-bound result envelopes out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mpp_ingest::dead_letter::DeadLetterStore;
use mpp_ingest::publisher::HttpPublisher;
use mpp_ingest::store::StateStore;
use mpp_ingest::{build_router, AppState, IngestConfig, IngestEngine};

/// Command-line arguments for mpp-ingest
#[derive(Parser, Debug)]
#[command(name = "mpp-ingest")]
#[command(about = "Idempotent ingestor for the mastery progress pipeline")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "5760", env = "MPP_INGEST_PORT")]
    port: u16,

    /// Root folder holding the pipeline database
    #[arg(short, long, env = "MPP_ROOT_FOLDER")]
    root_folder: Option<String>,

    /// Base URL of the event bridge
    #[arg(long, default_value = "http://127.0.0.1:5761", env = "MPP_BRIDGE_URL")]
    bridge_url: String,

    /// Number of processing lanes
    #[arg(long, default_value = "4", env = "MPP_INGEST_LANES")]
    lanes: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mpp_ingest=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting MPP Ingestor on port {}", args.port);

    let root_folder =
        mpp_common::config::resolve_root_folder(args.root_folder.as_deref(), "MPP_ROOT_FOLDER");
    let db_path = mpp_common::config::database_path(&root_folder);
    info!("Database path: {}", db_path.display());

    let pool = mpp_common::db::init_database(&db_path)
        .await
        .context("Failed to initialize database")?;

    let store = StateStore::new(pool.clone());
    let dead_letters = DeadLetterStore::new(pool);
    let publisher = Arc::new(HttpPublisher::new(&args.bridge_url));

    let config = IngestConfig {
        lanes: args.lanes,
        ..IngestConfig::default()
    };
    let engine = Arc::new(IngestEngine::new(
        store.clone(),
        dead_letters.clone(),
        publisher,
        config,
    ));
    info!("Ingest engine initialized with {} lanes", engine.lane_count());

    // Background sweeper: expired state rows and reviewed dead letters
    {
        let store = store.clone();
        let dead_letters = dead_letters.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                if let Err(e) = store.purge_expired().await {
                    warn!("State sweep failed: {}", e);
                }
                if let Err(e) = dead_letters.purge_reviewed().await {
                    warn!("Dead-letter sweep failed: {}", e);
                }
            }
        });
    }

    let state = AppState {
        engine,
        store,
        dead_letters,
    };
    let app = build_router(state);

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
