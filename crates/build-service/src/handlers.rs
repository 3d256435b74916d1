//! API handlers for the build service.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header::USER_AGENT, HeaderMap, StatusCode},
    response::{AppendHeaders, IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::info;

use crate::config::Config;
use crate::models::{BuildResponse, EnqueueOutcome, JobStatus};
use crate::storage::Storage;
use package_resolver::{resolve, PackageChange, ResolverInput};
use wrtforge_common::{BuildRequest, Error as RequestError};

/// Shared application state
pub struct AppState {
    pub storage: Mutex<Storage>,
    pub config: Arc<Config>,
    /// Wakes a worker when a job is admitted.
    pub build_notify: Arc<Notify>,
}

/// API error type: every error leaves the service as `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
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

/// Response of the prepare endpoint: the resolver outcome without a job.
#[derive(Debug, Serialize)]
pub struct PrepareResponse {
    pub status: &'static str,
    pub original_packages: Vec<String>,
    pub resolved_packages: Vec<String>,
    pub changes: Vec<PackageChange>,
    pub prepared_request: BuildRequest,
    pub request_hash: String,
    pub cache_available: bool,
}

/// Health check
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "build-service"
    }))
}

/// Submit a build request: cache hit, subscription to an in-flight job,
/// or admission of a new one.
pub async fn submit_build_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut request): Json<BuildRequest>,
) -> Result<Response, ApiError> {
    let user_agent = headers.get(USER_AGENT).and_then(|v| v.to_str().ok());
    request.client = Some(client_identifier(request.client.take(), user_agent));

    request
        .canonicalize(&state.config.limits())
        .map_err(ApiError::from)?;

    let mut storage = state.storage.lock().await;
    storage.bump_counter("requests")?;

    if let Some(result) = storage.get_result(&request.request_hash)? {
        storage.bump_counter("cache_hits")?;
        info!("Cache hit for {}", request.request_hash);
        return Ok((StatusCode::OK, Json(BuildResponse::from_result(&result, true))).into_response());
    }

    if let Some(job) = storage.get_job(&request.request_hash)? {
        if job.status.is_active() {
            // Second identical submission subscribes to the existing job.
            let position = storage.queue_position(&request.request_hash)?;
            return Ok(accepted_response(BuildResponse::from_job(&job, position)));
        }
        if job.status == JobStatus::Failed {
            // Failures stay cached until the failure TTL expires them.
            return Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(BuildResponse::from_job(&job, None)),
            )
                .into_response());
        }
    }

    if storage.queue_length()? >= state.config.max_pending_jobs {
        return Err(ApiError {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "queue is full, please try again later".to_string(),
        });
    }

    storage.put_request(&request)?;

    match storage.enqueue(&request.request_hash)? {
        EnqueueOutcome::Queued { position } => {
            info!(
                "Enqueued {} at position {} for client {}",
                request.request_hash,
                position,
                request.client.as_deref().unwrap_or("unknown")
            );
            state.build_notify.notify_one();

            let job = storage
                .get_job(&request.request_hash)?
                .ok_or_else(|| anyhow::anyhow!("job vanished after enqueue"))?;
            Ok(accepted_response(BuildResponse::from_job(&job, Some(position))))
        }
        EnqueueOutcome::AlreadyInFlight => {
            let job = storage
                .get_job(&request.request_hash)?
                .ok_or_else(|| anyhow::anyhow!("in-flight job not found"))?;
            let position = storage.queue_position(&request.request_hash)?;
            Ok(accepted_response(BuildResponse::from_job(&job, position)))
        }
        EnqueueOutcome::AlreadyBuilt => {
            let result = storage
                .get_result(&request.request_hash)?
                .ok_or_else(|| anyhow::anyhow!("result vanished after enqueue"))?;
            storage.bump_counter("cache_hits")?;
            Ok((StatusCode::OK, Json(BuildResponse::from_result(&result, true))).into_response())
        }
    }
}

/// Poll a build by fingerprint.
pub async fn build_status_handler(
    State(state): State<Arc<AppState>>,
    Path(request_hash): Path<String>,
) -> Result<Response, ApiError> {
    let storage = state.storage.lock().await;

    if let Some(result) = storage.get_result(&request_hash)? {
        let cache_hit = result.cache_hit;
        return Ok((StatusCode::OK, Json(BuildResponse::from_result(&result, cache_hit))).into_response());
    }

    let Some(job) = storage.get_job(&request_hash)? else {
        return Err(ApiError {
            status: StatusCode::NOT_FOUND,
            message: "could not find provided request hash".to_string(),
        });
    };

    match job.status {
        JobStatus::Pending | JobStatus::Building => {
            let position = storage.queue_position(&request_hash)?;
            Ok(accepted_response(BuildResponse::from_job(&job, position)))
        }
        JobStatus::Failed => Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(BuildResponse::from_job(&job, None)),
        )
            .into_response()),
        // Completed without a result only happens mid-expiry.
        JobStatus::Completed => Err(ApiError {
            status: StatusCode::NOT_FOUND,
            message: "build result expired".to_string(),
        }),
    }
}

/// Resolve packages without enqueueing anything: the "show changes before
/// building" flow. The returned prepared request can be POSTed to the
/// build endpoint verbatim.
pub async fn prepare_handler(
    State(state): State<Arc<AppState>>,
    Json(mut request): Json<BuildRequest>,
) -> Result<Response, ApiError> {
    request
        .canonicalize(&state.config.limits())
        .map_err(ApiError::from)?;

    let original_packages = request.packages.clone();

    // Prepare runs without a container probe; migrations and hardware
    // rules do not depend on the default set.
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
    .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let mut prepared = request.clone();
    prepared.packages = resolution.packages.clone();
    prepared.skip_package_resolution = true;
    prepared.canonicalize(&state.config.limits()).map_err(ApiError::from)?;

    let storage = state.storage.lock().await;
    let cache_available = storage.get_result(&prepared.request_hash)?.is_some();

    let request_hash = prepared.request_hash.clone();
    Ok(Json(PrepareResponse {
        status: "prepared",
        original_packages,
        resolved_packages: resolution.packages,
        changes: resolution.changes,
        prepared_request: prepared,
        request_hash,
        cache_available,
    })
    .into_response())
}

/// Queue length and event counters.
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let storage = state.storage.lock().await;
    let queue_length = storage.queue_length()?;
    let counters = storage.counters()?;

    Ok(Json(serde_json::json!({
        "queue_length": queue_length,
        "counters": counters,
    }))
    .into_response())
}

/// 202 with the live queue position mirrored into a header.
fn accepted_response(response: BuildResponse) -> Response {
    let position = response.queue_position.unwrap_or(0);
    (
        StatusCode::ACCEPTED,
        AppendHeaders([("x-queue-position", position.to_string())]),
        Json(response),
    )
        .into_response()
}

/// Derive the opaque client identifier: an explicit field wins, then an
/// `auc` user agent, then unknown.
fn client_identifier(client: Option<String>, user_agent: Option<&str>) -> String {
    if let Some(client) = client {
        if !client.is_empty() {
            return client;
        }
    }

    if let Some(agent) = user_agent {
        if agent.starts_with("auc") {
            return agent.replace(" (", "/").replace(')', "");
        }
    }

    "unknown/0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_identifier_prefers_explicit_field() {
        assert_eq!(
            client_identifier(Some("luci/1.0".to_string()), Some("curl/8.0")),
            "luci/1.0"
        );
    }

    #[test]
    fn test_client_identifier_parses_auc_agent() {
        assert_eq!(
            client_identifier(None, Some("auc (0.3.2)")),
            "auc/0.3.2"
        );
    }

    #[test]
    fn test_client_identifier_falls_back_to_unknown() {
        assert_eq!(client_identifier(None, Some("curl/8.0")), "unknown/0");
        assert_eq!(client_identifier(Some(String::new()), None), "unknown/0");
    }
}
