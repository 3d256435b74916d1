//! Build Service
//!
//! REST API for queuing firmware builds plus the background workers that
//! run them. Requests are deduplicated by fingerprint, queued in SQLite
//! and built inside ephemeral ImageBuilder containers.

pub mod builder;
pub mod config;
pub mod container;
pub mod handlers;
pub mod janitor;
pub mod models;
pub mod storage;
pub mod worker;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use builder::{BuildError, BuildOutcome, BuildPhase, Builder};
pub use config::Config;
pub use container::{ContainerRunner, Mount, RunOptions};
pub use handlers::AppState;
pub use models::{BuildJob, BuildResponse, BuildResult, EnqueueOutcome, JobStatus};
pub use storage::Storage;
pub use worker::{spawn_workers, Worker};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/api/v1/stats", get(handlers::stats_handler))
        .route("/api/v1/build", post(handlers::submit_build_handler))
        .route("/api/v1/build/prepare", post(handlers::prepare_handler))
        .route(
            "/api/v1/build/:request_hash",
            get(handlers::build_status_handler),
        )
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
