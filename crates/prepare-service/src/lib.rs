//! Prepare Service
//!
//! Standalone deployment of the "show changes before building" flow.
//! Wraps the `package-resolver` library behind HTTP: it validates a
//! request, resolves its package list and reports the changes, without
//! ever touching a queue, a database or a container runtime.
//!
//! ## Endpoints
//!
//! - `POST /api/v1/build/prepare` - Resolve packages without building
//! - `GET /api/v1/status` - Service capabilities
//! - `GET /health` - Health check

pub mod config;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use wrtforge_common::RequestLimits;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Validation caps applied during canonicalization
    pub limits: Arc<RequestLimits>,
}

impl AppState {
    /// Create new application state
    pub fn new(limits: RequestLimits) -> Self {
        Self {
            limits: Arc::new(limits),
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/api/v1/status", get(handlers::status_handler))
        .route("/api/v1/build/prepare", post(handlers::prepare_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
