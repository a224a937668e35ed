//! Checkpoint Store: durable, lenient, merge-on-write job checkpoints.
//!
//! The repository only moves raw JSON; merging, defaulting, version migration
//! and the resume decision live in `CheckpointStore` so every backend behaves
//! the same.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, warn};

use super::error::{JobError, JobResult};
use super::models::{Checkpoint, CheckpointPatch, Phase, CHECKPOINT_VERSION};
use crate::common::{Clock, JobId};

// ============================================================================
// Repository (raw storage)
// ============================================================================

#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    /// The stored checkpoint blob, if a session row exists.
    async fn read(&self, job_id: JobId) -> Result<Option<Value>>;

    /// Insert or replace the session's checkpoint blob.
    async fn write(&self, job_id: JobId, checkpoint: &Value, version: i32) -> Result<()>;
}

pub struct PostgresCheckpointRepository {
    pool: PgPool,
}

impl PostgresCheckpointRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointRepository for PostgresCheckpointRepository {
    async fn read(&self, job_id: JobId) -> Result<Option<Value>> {
        let checkpoint = sqlx::query_scalar::<_, Value>(
            "SELECT checkpoint FROM research_sessions WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read checkpoint")?;
        Ok(checkpoint)
    }

    async fn write(&self, job_id: JobId, checkpoint: &Value, version: i32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO research_sessions (job_id, checkpoint, checkpoint_version, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (job_id) DO UPDATE
            SET checkpoint = EXCLUDED.checkpoint,
                checkpoint_version = EXCLUDED.checkpoint_version,
                updated_at = NOW()
            "#,
        )
        .bind(job_id)
        .bind(checkpoint)
        .bind(version)
        .execute(&self.pool)
        .await
        .context("Failed to write checkpoint")?;
        Ok(())
    }
}

// ============================================================================
// Store
// ============================================================================

/// Where a paused or orphaned job continues.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub phase: Phase,
    pub checkpoint: Checkpoint,
}

#[derive(Clone)]
pub struct CheckpointStore {
    repo: Arc<dyn CheckpointRepository>,
    clock: Arc<dyn Clock>,
}

impl CheckpointStore {
    pub fn new(repo: Arc<dyn CheckpointRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    /// Merge `patch` into the stored checkpoint and stamp `last_checkpoint_time`.
    ///
    /// An unreadable stored record is replaced by the patch merged over
    /// defaults. Only a failed write is an error.
    pub async fn save(&self, job_id: JobId, patch: CheckpointPatch) -> JobResult<Checkpoint> {
        let mut checkpoint = match self.repo.read(job_id).await? {
            None => Checkpoint::default(),
            Some(stored) => Checkpoint::decode(&stored).unwrap_or_else(|reason| {
                warn!(
                    job_id = %job_id,
                    reason = %reason,
                    "overwriting unreadable checkpoint"
                );
                Checkpoint::default()
            }),
        };

        patch.apply(&mut checkpoint);
        checkpoint.last_checkpoint_time = Some(self.clock.now());

        self.repo
            .write(job_id, &checkpoint.encode(), CHECKPOINT_VERSION)
            .await?;

        debug!(
            job_id = %job_id,
            done = checkpoint.work_items_done.len(),
            queued = checkpoint.work_items_queued.len(),
            "checkpoint saved"
        );
        Ok(checkpoint)
    }

    /// The stored checkpoint, or the empty one if none exists.
    pub async fn load(&self, job_id: JobId) -> JobResult<Checkpoint> {
        self.load_existing(job_id)
            .await
            .map(Option::unwrap_or_default)
    }

    async fn load_existing(&self, job_id: JobId) -> JobResult<Option<Checkpoint>> {
        match self.repo.read(job_id).await? {
            None => Ok(None),
            Some(stored) => Checkpoint::decode(&stored)
                .map(Some)
                .map_err(|reason| JobError::CorruptCheckpoint { job_id, reason }),
        }
    }

    /// Reset to the empty checkpoint (a run restarted from scratch).
    pub async fn clear(&self, job_id: JobId) -> JobResult<()> {
        self.repo
            .write(job_id, &Checkpoint::default().encode(), CHECKPOINT_VERSION)
            .await?;
        Ok(())
    }

    /// True if a checkpoint exists with finished sub-steps or queued work.
    ///
    /// An unreadable checkpoint is not resumable.
    pub async fn can_resume(&self, job_id: JobId) -> JobResult<bool> {
        match self.load_existing(job_id).await {
            Ok(checkpoint) => Ok(checkpoint.is_some_and(|c| c.is_resumable())),
            Err(JobError::CorruptCheckpoint { reason, .. }) => {
                warn!(job_id = %job_id, reason = %reason, "checkpoint unreadable, not resumable");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn resume_phase(&self, job_id: JobId) -> JobResult<Phase> {
        Ok(self.load(job_id).await?.resume_phase())
    }

    pub async fn resume_point(&self, job_id: JobId) -> JobResult<ResumePoint> {
        let checkpoint = self.load(job_id).await?;
        Ok(ResumePoint {
            phase: checkpoint.resume_phase(),
            checkpoint,
        })
    }
}
