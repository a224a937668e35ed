//! Application setup and server configuration.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Extension,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::domains::research::JobOrchestrator;
use crate::server::routes::{
    create_job_handler, get_job_handler, health_handler, job_progress_handler,
    pause_job_handler, rescan_job_handler, resume_job_handler, start_job_handler, BackendProbe,
};

/// Upper bound for any request; pause waits for the worker inside the request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: JobOrchestrator,
    pub probes: Vec<Arc<dyn BackendProbe>>,
}

impl AppState {
    pub fn new(orchestrator: JobOrchestrator) -> Self {
        Self {
            orchestrator,
            probes: Vec::new(),
        }
    }

    /// Add a backend to the health report.
    pub fn with_probe(mut self, probe: Arc<dyn BackendProbe>) -> Self {
        self.probes.push(probe);
        self
    }
}

/// Build the Axum application router
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(create_job_handler))
        .route("/jobs/:id", get(get_job_handler))
        .route("/jobs/:id/start", post(start_job_handler))
        .route("/jobs/:id/pause", post(pause_job_handler))
        .route("/jobs/:id/resume", post(resume_job_handler))
        .route("/jobs/:id/rescan", post(rescan_job_handler))
        .route("/jobs/:id/progress", get(job_progress_handler))
        .route("/health", get(health_handler))
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(Extension(state))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
