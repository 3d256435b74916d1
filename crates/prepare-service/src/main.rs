//! Prepare Service
//!
//! Standalone REST API for resolving build request package lists.

use anyhow::{Context, Result};
use prepare_service::{config::Config, create_router, AppState};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt().with_target(false).compact().init();

    info!("Starting Prepare Service");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        "Configuration loaded - listening on {}",
        config.api_address()
    );

    // Create application state
    let state = AppState::new(config.limits());

    // Create router
    let app = create_router(state);

    // Start server
    let listener = TcpListener::bind(&config.api_address())
        .await
        .with_context(|| format!("Failed to bind to {}", config.api_address()))?;

    info!("Prepare Service listening on {}", config.api_address());
    info!("  POST /api/v1/build/prepare - Resolve packages without building");
    info!("  GET  /api/v1/status - Service capabilities");
    info!("  GET  /health - Health check");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
