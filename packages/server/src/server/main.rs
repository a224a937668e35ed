// Main entry point for the research job server

use std::sync::Arc;

use anyhow::{Context, Result};
use research_core::domains::research::{JobOrchestrator, PhaseRegistry};
use research_core::kernel::{JobDeps, RedisJobCache};
use research_core::server::{build_app, routes::PostgresProbe, AppState};
use research_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,research_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting research job server");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Connect to Redis (progress cache + job locks)
    let cache = Arc::new(
        RedisJobCache::connect(&config.redis_url)
            .await
            .context("Failed to connect to Redis")?,
    );
    tracing::info!("Redis connected");

    // Phase executors are provided by the embedding application.
    let registry = PhaseRegistry::new();
    let deps = JobDeps::production(pool.clone(), cache.clone(), config.jobs.clone());
    let orchestrator = JobOrchestrator::new(deps, registry.clone());

    // Recover jobs orphaned by the previous process
    if registry.is_empty() {
        tracing::warn!("No phase executors registered; skipping startup recovery");
    } else {
        let report = orchestrator
            .startup()
            .await
            .context("Failed to recover in-progress jobs")?;
        tracing::info!(
            failed_stale = report.failed_stale.len(),
            resumed = report.resumed.len(),
            restarted = report.restarted.len(),
            skipped = report.skipped.len(),
            "Startup recovery complete"
        );
    }

    // Build application
    let state = AppState::new(orchestrator)
        .with_probe(Arc::new(PostgresProbe(pool)))
        .with_probe(cache);
    let app = build_app(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    Ok(())
}
