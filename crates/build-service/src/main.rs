//! Build Service
//!
//! REST API for queuing builds + background workers for processing them

use std::sync::Arc;

use anyhow::{Context, Result};
use build_service::{create_router, janitor, spawn_workers, AppState, Config, Storage};
use tokio::sync::{Mutex, Notify};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "build_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Configuration (reads .env and environment variables)
    let config = Arc::new(Config::from_env().context("Failed to load configuration")?);

    info!("Starting Build Service");
    info!("Database: {}", config.database_path.display());
    info!("Store: {}", config.store_path.display());
    info!(
        "Container runtime: {} ({})",
        config.container_runtime, config.imagebuilder_registry
    );

    // Ensure the artifact store exists
    std::fs::create_dir_all(&config.store_path).context("Failed to create store directory")?;

    // Storage for the API
    let mut api_storage =
        Storage::open(&config.database_path).context("Failed to initialize API storage")?;

    // Sweep jobs a previous process left in BUILDING
    janitor::recover_stale_jobs(&mut api_storage, &config.store_path)
        .context("Failed to recover stale jobs")?;

    let build_notify = Arc::new(Notify::new());

    // Create application state
    let state = AppState {
        storage: Mutex::new(api_storage),
        config: config.clone(),
        build_notify: build_notify.clone(),
    };

    // Create router
    let app = create_router(state);

    // Spawn build workers, each with its own storage connection
    let worker_handles =
        spawn_workers(config.clone(), build_notify).context("Failed to spawn workers")?;
    info!("{} worker(s) started", worker_handles.len());

    // Spawn the TTL janitor
    let janitor_storage =
        Storage::open(&config.database_path).context("Failed to initialize janitor storage")?;
    tokio::spawn(janitor::run(janitor_storage, config.clone()));

    // Start API server
    let addr = config.api_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    info!("Build Service API running on http://{}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
