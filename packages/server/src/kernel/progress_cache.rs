// Trait definitions for the ephemeral job cache
//
// Two concerns share one backend (Redis in production):
// - ProgressCache: live progress + activity text polled by the UI (best effort)
// - LockStore: the per-job mutual-exclusion record (required for control ops)

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::JobId;
use crate::domains::research::models::Phase;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("cache entry could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Live progress for one job. Informational only; the checkpoint is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub phase: Phase,
    pub percent_complete: f64,
    pub current_activity: Option<String>,
    pub counts: BTreeMap<String, i64>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn count(&self, counter: &str) -> i64 {
        self.counts.get(counter).copied().unwrap_or(0)
    }
}

// =============================================================================
// Progress (best effort)
// =============================================================================

#[async_trait]
pub trait ProgressCache: Send + Sync {
    async fn set_progress(&self, job_id: JobId, snapshot: &ProgressSnapshot)
        -> Result<(), CacheError>;

    async fn get_progress(&self, job_id: JobId) -> Result<Option<ProgressSnapshot>, CacheError>;

    async fn set_activity(&self, job_id: JobId, text: &str) -> Result<(), CacheError>;

    async fn get_activity(&self, job_id: JobId) -> Result<Option<String>, CacheError>;
}

// =============================================================================
// Locks (fail closed)
// =============================================================================

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomic create-if-absent. Returns false if a different, unexpired token
    /// holds the lock. Re-acquiring with the holder's own token refreshes the TTL.
    async fn acquire_lock(
        &self,
        job_id: JobId,
        holder_token: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Atomic compare-and-delete. Only the holder's token releases the lock.
    async fn release_lock(&self, job_id: JobId, holder_token: &str) -> Result<bool, CacheError>;

    /// Atomic compare-and-refresh of the TTL.
    async fn extend_lock(
        &self,
        job_id: JobId,
        holder_token: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError>;
}
