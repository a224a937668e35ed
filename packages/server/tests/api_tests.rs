//! HTTP control surface tests.
//!
//! Drives the axum router in-process with `tower::ServiceExt::oneshot`.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use research_core::common::{JobId, SubjectId};
use research_core::domains::research::testing::ItemExecutor;
use research_core::kernel::LockStore;
use research_core::server::routes::BackendProbe;
use research_core::server::{build_app, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::common::Fixture;

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn app_for(fx: &Fixture) -> Router {
    build_app(AppState::new(fx.orchestrator.clone()))
}

async fn create_job(app: &Router) -> JobId {
    let (status, body) = send(
        app,
        Method::POST,
        "/jobs",
        Some(json!({ "reference_id": SubjectId::new() })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["status"], "IN_PROGRESS");
    assert_eq!(body["phase"], "CRAWL");
    serde_json::from_value(body["id"].clone()).unwrap()
}

#[tokio::test]
async fn test_pause_resume_round_trip_over_http() {
    let fx = Fixture::new(ItemExecutor::pages(6).gated());
    let app = app_for(&fx);
    let job_id = create_job(&app).await;

    fx.crawl.release(2);
    assert!(fx.crawl.wait_for_processed(2).await);

    let (status, body) = send(&app, Method::POST, &format!("/jobs/{}/pause", job_id), None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "PAUSED");
    assert_eq!(body["checkpoint_saved"], true);
    assert!(body["paused_at"].is_string());

    let (status, body) = send(&app, Method::POST, &format!("/jobs/{}/pause", job_id), None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");
    assert_eq!(body["code"], "invalid_state");
    assert_eq!(body["safe_to_retry"], true);

    let (status, body) = send(&app, Method::POST, &format!("/jobs/{}/resume", job_id), None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "IN_PROGRESS");
    assert_eq!(body["resumed_from"]["phase"], "CRAWL");
    assert_eq!(body["resumed_from"]["work_items_done_count"], 2);
    assert_eq!(body["resumed_from"]["entities_count"], 2);

    let (status, body) = send(&app, Method::GET, &format!("/jobs/{}/progress", job_id), None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "IN_PROGRESS");
    assert_eq!(body["counts"]["work_items_done"], 2);

    let (status, body) = send(&app, Method::GET, &format!("/jobs/{}", job_id), None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "IN_PROGRESS");
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let fx = Fixture::new(ItemExecutor::pages(1));
    let app = app_for(&fx);

    let (status, body) = send(&app, Method::GET, &format!("/jobs/{}", JobId::new()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, body) =
        send(&app, Method::POST, &format!("/jobs/{}/pause", JobId::new()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn test_held_lock_is_a_conflict() {
    let fx = Fixture::new(ItemExecutor::pages(3).gated());
    let app = app_for(&fx);
    let job_id = create_job(&app).await;

    fx.backends
        .cache
        .acquire_lock(job_id, "peer", std::time::Duration::from_secs(60))
        .await
        .unwrap();

    let (status, body) = send(&app, Method::POST, &format!("/jobs/{}/pause", job_id), None).await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");
    assert_eq!(body["code"], "lock_held");
    assert_eq!(body["safe_to_retry"], true);
}

#[tokio::test]
async fn test_lock_store_outage_is_unavailable() {
    let fx = Fixture::new(ItemExecutor::pages(3).gated());
    let app = app_for(&fx);
    let job_id = create_job(&app).await;

    fx.backends.cache.set_locks_down(true);
    let (status, body) = send(&app, Method::POST, &format!("/jobs/{}/pause", job_id), None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{body}");
    assert_eq!(body["code"], "lock_unavailable");
    assert_eq!(fx.job(job_id).status.as_str(), "IN_PROGRESS");
}

// =============================================================================
// Health
// =============================================================================

struct DownProbe;

#[async_trait]
impl BackendProbe for DownProbe {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn check(&self) -> Result<(), String> {
        Err("connection refused".to_string())
    }
}

#[tokio::test]
async fn test_health_reports_backend_status() {
    let fx = Fixture::new(ItemExecutor::pages(1));

    let (status, body) = send(&app_for(&fx), Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let app = build_app(AppState::new(fx.orchestrator.clone()).with_probe(Arc::new(DownProbe)));
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["backends"]["cache"]["error"], "connection refused");
}
