//! Durable storage for research job rows.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use super::models::{JobStatus, ResearchJob};
use crate::common::JobId;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &ResearchJob) -> Result<()>;

    async fn find(&self, job_id: JobId) -> Result<Option<ResearchJob>>;

    /// Persist every mutable field of `job` (status, phase, timestamps, failure).
    async fn update(&self, job: &ResearchJob) -> Result<()>;

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ResearchJob>>;
}

const JOB_COLUMNS: &str = r#"
    id, reference_id, status, phase, started_at, completed_at, paused_at,
    total_paused_ms, time_budget_secs, failure_kind, failure_reason,
    created_at, updated_at
"#;

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: &ResearchJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO research_jobs (
                id, reference_id, status, phase, started_at, completed_at, paused_at,
                total_paused_ms, time_budget_secs, failure_kind, failure_reason,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(job.id)
        .bind(job.reference_id)
        .bind(job.status)
        .bind(job.phase)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.paused_at)
        .bind(job.total_paused_ms)
        .bind(job.time_budget_secs)
        .bind(job.failure_kind)
        .bind(&job.failure_reason)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert research job")?;
        Ok(())
    }

    async fn find(&self, job_id: JobId) -> Result<Option<ResearchJob>> {
        let job = sqlx::query_as::<_, ResearchJob>(&format!(
            "SELECT {} FROM research_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load research job")?;
        Ok(job)
    }

    async fn update(&self, job: &ResearchJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE research_jobs
            SET status = $1,
                phase = $2,
                started_at = $3,
                completed_at = $4,
                paused_at = $5,
                total_paused_ms = $6,
                failure_kind = $7,
                failure_reason = $8,
                updated_at = $9
            WHERE id = $10
            "#,
        )
        .bind(job.status)
        .bind(job.phase)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.paused_at)
        .bind(job.total_paused_ms)
        .bind(job.failure_kind)
        .bind(&job.failure_reason)
        .bind(job.updated_at)
        .bind(job.id)
        .execute(&self.pool)
        .await
        .context("Failed to update research job")?;

        anyhow::ensure!(
            result.rows_affected() == 1,
            "research job {} disappeared during update",
            job.id
        );
        Ok(())
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ResearchJob>> {
        let jobs = sqlx::query_as::<_, ResearchJob>(&format!(
            "SELECT {} FROM research_jobs WHERE status = $1 ORDER BY created_at",
            JOB_COLUMNS
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list research jobs by status")?;
        Ok(jobs)
    }
}
