//! Postern - signed upload gateway

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use postern::{config::Args, server, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("postern={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Print startup banner
    info!("======================================");
    info!("  Postern - Signed Upload Gateway");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Listen: {}", args.listen);
    info!("Ledger: {}", args.ledger_url);
    info!("Storage: {} (bucket {})", args.storage_url, args.storage_bucket);
    info!(
        "Public URLs: {}://{}:{}",
        args.public_scheme, args.public_host, args.public_port
    );
    info!("Minimum reputation: {}", args.min_reputation);
    info!("Request limits: {}", args.request_limits);
    info!("Data limits: {} (MB)", args.data_limits);
    if args.allow_test_signer {
        warn!("Test signer key ENABLED - not a production configuration");
    }
    info!("======================================");

    let state = AppState::new(args)?;

    // Attach the audit log file if configured
    if let Some(path) = state.args.audit_log.clone() {
        if let Err(e) = state.audit.init_file(path).await {
            error!("Failed to open audit log: {}", e);
            std::process::exit(1);
        }
    }

    server::run(Arc::new(state)).await?;

    Ok(())
}
