//! Daemon entry point for the upload engine.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use uploader_core::{
    ApiPool, Database, EngineConfig, StatusGate, TaskStore, TracingOverlay, TracingPageCache,
    UploadEngine,
};

mod cli;

use cli::Args;

/// Installs the tracing subscriber. An explicit `RUST_LOG` beats the
/// flag-derived directive.
fn init_tracing(args: &Args) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    info!("uploader starting");

    let db = Database::new(&args.database).await?;
    let store = TaskStore::new(db.clone());
    let api = ApiPool::new(args.api_base, args.auth)?;

    // The session layer that flips individual bits is not part of this
    // daemon; it starts with the gate open and embedders drive it through
    // UploadEngine::status_gate().
    let gate = Arc::new(StatusGate::ready());

    let engine = UploadEngine::new(
        store,
        api,
        gate,
        Arc::new(TracingOverlay),
        Arc::new(TracingPageCache),
        EngineConfig::new(&args.cache_dir),
    );
    engine.init();
    info!(database = %args.database.display(), cache_dir = %args.cache_dir.display(), "upload engine running");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    engine.shutdown().await;
    db.close().await;

    Ok(())
}
