//! Integration tests for the Prepare Service

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use prepare_service::{create_router, AppState};
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`
use wrtforge_common::RequestLimits;

fn create_test_app() -> Router {
    create_router(AppState::new(RequestLimits::default()))
}

async fn post_prepare(app: Router, body: Value) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/build/prepare")
                .method("POST")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_health_check() {
    let app = create_test_app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "prepare-service");
}

#[tokio::test]
async fn test_status_reports_capabilities() {
    let app = create_test_app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(json["capabilities"]["package_resolution"], true);
    assert_eq!(json["capabilities"]["build_execution"], false);
}

#[tokio::test]
async fn test_prepare_applies_migrations() {
    let app = create_test_app();

    let (status, json) = post_prepare(
        app,
        json!({
            "version": "24.10.0",
            "target": "ath79/generic",
            "profile": "tplink_archer-c7-v5",
            "packages": ["luci", "auc", "luci-i18n-opkg-en"]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "prepared");

    let resolved: Vec<&str> = json["resolved_packages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(resolved.contains(&"owut"));
    assert!(resolved.contains(&"luci-i18n-package-manager-en"));
    assert!(!resolved.contains(&"auc"));
    assert!(!resolved.contains(&"luci-i18n-opkg-en"));

    let changes = json["changes"].as_array().unwrap();
    assert_eq!(changes.len(), 2);
    assert!(changes.iter().any(|c| {
        c["from_package"] == "auc" && c["to_package"] == "owut" && c["type"] == "migration"
    }));
}

#[tokio::test]
async fn test_prepare_keeps_untouched_requests_unchanged() {
    let app = create_test_app();

    let (status, json) = post_prepare(
        app,
        json!({
            "version": "23.05.5",
            "target": "ath79/generic",
            "profile": "tplink_archer-c7-v5",
            "packages": ["luci", "htop"]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["changes"].as_array().unwrap().len(), 0);
    assert_eq!(json["resolved_packages"], json!(["htop", "luci"]));
    assert_eq!(json["original_packages"], json!(["htop", "luci"]));
}

#[tokio::test]
async fn test_prepared_request_round_trips_to_build() {
    let app = create_test_app();

    let (_, json) = post_prepare(
        app,
        json!({
            "version": "25.12.0",
            "target": "kirkwood/generic",
            "profile": "checkpoint_l-50",
            "packages": ["luci"]
        }),
    )
    .await;

    let prepared = &json["prepared_request"];
    assert_eq!(prepared["skip_package_resolution"], true);
    assert_eq!(prepared["version"], "25.12.0");
    assert!(prepared["packages"]
        .as_array()
        .unwrap()
        .iter()
        .any(|p| p == "kmod-dsa-mv88e6xxx"));

    // The reported hash belongs to the prepared request.
    assert_eq!(json["request_hash"], prepared["request_hash"]);
    assert_eq!(json["cache_available"], false);
}

#[tokio::test]
async fn test_prepare_rejects_invalid_request() {
    let app = create_test_app();

    let (status, json) = post_prepare(
        app,
        json!({
            "version": "23.05.0",
            "target": "not-a-target",
            "profile": "generic",
            "packages": ["luci"]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("target"));
}

#[tokio::test]
async fn test_prepare_rejects_empty_selection() {
    let app = create_test_app();

    let (status, json) = post_prepare(
        app,
        json!({
            "version": "23.05.0",
            "target": "ath79/generic",
            "profile": "generic",
            "packages": ["-busybox"],
            "diff_packages": true
        }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("empty"));
}
