use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::Extension, http::StatusCode, Json};
use futures::future::join_all;
use serde::Serialize;
use sqlx::PgPool;

use crate::kernel::RedisJobCache;
use crate::server::app::AppState;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// A backend the health endpoint can check.
#[async_trait]
pub trait BackendProbe: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self) -> Result<(), String>;
}

pub struct PostgresProbe(pub PgPool);

#[async_trait]
impl BackendProbe for PostgresProbe {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn check(&self) -> Result<(), String> {
        sqlx::query("SELECT 1")
            .execute(&self.0)
            .await
            .map(|_| ())
            .map_err(|e| format!("Query failed: {}", e))
    }
}

#[async_trait]
impl BackendProbe for RedisJobCache {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn check(&self) -> Result<(), String> {
        self.ping().await.map_err(|e| format!("Ping failed: {}", e))
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    backends: BTreeMap<&'static str, BackendHealth>,
}

#[derive(Serialize)]
pub struct BackendHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Health check endpoint
///
/// Checks every configured backend concurrently, each with a 5 second timeout.
/// Returns 200 OK if all are healthy, 503 Service Unavailable otherwise.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let checks = state.probes.iter().map(|probe| async move {
        let health = match tokio::time::timeout(CHECK_TIMEOUT, probe.check()).await {
            Ok(Ok(())) => BackendHealth {
                status: "ok".to_string(),
                error: None,
            },
            Ok(Err(e)) => BackendHealth {
                status: "error".to_string(),
                error: Some(e),
            },
            Err(_) => BackendHealth {
                status: "error".to_string(),
                error: Some("Check timeout (>5s)".to_string()),
            },
        };
        (probe.name(), health)
    });
    let backends: BTreeMap<_, _> = join_all(checks).await.into_iter().collect();

    let is_healthy = backends.values().all(|b| b.status == "ok");
    let (status_code, overall_status) = if is_healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    (
        status_code,
        Json(HealthResponse {
            status: overall_status.to_string(),
            backends,
        }),
    )
}
