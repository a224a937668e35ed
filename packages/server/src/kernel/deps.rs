//! Job dependencies (using traits for testability)
//!
//! Central container handed to the orchestrator. Every backend sits behind a
//! trait so tests can swap in the in-memory versions from `kernel::testing`.

use std::sync::Arc;

use sqlx::PgPool;

use super::progress_cache::{LockStore, ProgressCache};
use super::redis_cache::RedisJobCache;
use crate::common::{Clock, SystemClock};
use crate::config::JobSettings;
use crate::domains::research::{
    CheckpointRepository, CheckpointStore, JobStore, PostgresCheckpointRepository,
    PostgresJobStore,
};

#[derive(Clone)]
pub struct JobDeps {
    pub jobs: Arc<dyn JobStore>,
    pub checkpoints: CheckpointStore,
    /// Best effort; outages only cost live progress.
    pub progress: Arc<dyn ProgressCache>,
    /// Required; control operations fail closed without it.
    pub locks: Arc<dyn LockStore>,
    pub clock: Arc<dyn Clock>,
    pub settings: JobSettings,
}

impl JobDeps {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        checkpoint_repo: Arc<dyn CheckpointRepository>,
        progress: Arc<dyn ProgressCache>,
        locks: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
        settings: JobSettings,
    ) -> Self {
        Self {
            jobs,
            checkpoints: CheckpointStore::new(checkpoint_repo, clock.clone()),
            progress,
            locks,
            clock,
            settings,
        }
    }

    /// Postgres for durable state, Redis for progress and locks.
    pub fn production(pool: PgPool, cache: Arc<RedisJobCache>, settings: JobSettings) -> Self {
        Self::new(
            Arc::new(PostgresJobStore::new(pool.clone())),
            Arc::new(PostgresCheckpointRepository::new(pool)),
            cache.clone(),
            cache,
            Arc::new(SystemClock),
            settings,
        )
    }
}
