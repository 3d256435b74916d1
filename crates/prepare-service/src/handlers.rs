//! API handlers for the prepare service.

use std::collections::BTreeSet;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::info;

use crate::AppState;
use package_resolver::{resolve, PackageChange, ResolverInput};
use wrtforge_common::{BuildRequest, Error as RequestError};

/// API error type: every error leaves the service as `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<RequestError> for ApiError {
    fn from(err: RequestError) -> Self {
        let status = match err {
            RequestError::Validation { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

/// Response of the prepare endpoint.
#[derive(Debug, Serialize)]
pub struct PrepareResponse {
    pub status: &'static str,
    pub original_packages: Vec<String>,
    pub resolved_packages: Vec<String>,
    pub changes: Vec<PackageChange>,
    pub prepared_request: BuildRequest,
    pub request_hash: String,
    /// Always false here: the standalone prepare service has no result
    /// store to consult. The build service answers this itself.
    pub cache_available: bool,
}

/// Health check
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "prepare-service"
    }))
}

/// Service capabilities, for operators wiring up the two-service shape.
pub async fn status_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "prepare-service",
        "status": "operational",
        "capabilities": {
            "package_resolution": true,
            "package_migration": true,
            "request_validation": true,
            "build_execution": false,
            "caching": false,
        }
    }))
}

/// Resolve a build request without executing it.
///
/// Validates, applies package changes for the version/target/profile and
/// returns the final list plus the change log. The prepared request can
/// be POSTed to the build service with resolution already done.
pub async fn prepare_handler(
    State(state): State<AppState>,
    Json(mut request): Json<BuildRequest>,
) -> Result<Json<PrepareResponse>, ApiError> {
    request.canonicalize(&state.limits).map_err(ApiError::from)?;

    let original_packages = request.packages.clone();

    let resolution = resolve(
        &ResolverInput {
            version: &request.version,
            target: &request.target,
            profile: &request.profile,
            packages: &request.packages,
            packages_versions: &request.packages_versions,
            diff_packages: request.diff_packages,
        },
        &BTreeSet::new(),
    )
    .map_err(|e| ApiError {
        status: StatusCode::BAD_REQUEST,
        message: e.to_string(),
    })?;

    let mut prepared = request.clone();
    prepared.packages = resolution.packages.clone();
    prepared.skip_package_resolution = true;
    prepared.canonicalize(&state.limits).map_err(ApiError::from)?;

    info!(
        "Prepared {}/{}/{} with {} change(s)",
        request.version,
        request.target,
        request.profile,
        resolution.changes.len()
    );

    let request_hash = prepared.request_hash.clone();
    Ok(Json(PrepareResponse {
        status: "prepared",
        original_packages,
        resolved_packages: resolution.packages,
        changes: resolution.changes,
        prepared_request: prepared,
        request_hash,
        cache_available: false,
    }))
}
