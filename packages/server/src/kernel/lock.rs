//! Per-job distributed lock built on a `LockStore`.
//!
//! Every holder gets a fresh random token, so a slow operation whose lock
//! already expired can never release a lock that a newer holder acquired.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::progress_cache::{CacheError, LockStore};
use crate::common::JobId;

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Proof of holding a job's lock. Must be handed back to `JobLock::release`.
#[derive(Debug)]
#[must_use = "a held lock must be released"]
pub struct LockGuard {
    job_id: JobId,
    token: String,
}

impl LockGuard {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

#[derive(Clone)]
pub struct JobLock {
    store: Arc<dyn LockStore>,
    ttl: Duration,
}

impl JobLock {
    pub fn new(store: Arc<dyn LockStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Single attempt. `Ok(None)` means another holder has it.
    pub async fn try_acquire(&self, job_id: JobId) -> Result<Option<LockGuard>, CacheError> {
        let token = Uuid::new_v4().to_string();
        if self.store.acquire_lock(job_id, &token, self.ttl).await? {
            debug!(job_id = %job_id, "job lock acquired");
            Ok(Some(LockGuard { job_id, token }))
        } else {
            Ok(None)
        }
    }

    /// Retry until acquired, `wait` elapses, or `abort` fires.
    pub async fn acquire_within(
        &self,
        job_id: JobId,
        wait: Duration,
        abort: Option<&CancellationToken>,
    ) -> Result<Option<LockGuard>, CacheError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(guard) = self.try_acquire(job_id).await? {
                return Ok(Some(guard));
            }
            if abort.is_some_and(CancellationToken::is_cancelled)
                || tokio::time::Instant::now() >= deadline
            {
                return Ok(None);
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Refresh the TTL for a long critical section. False if the lock was lost.
    pub async fn extend(&self, guard: &LockGuard) -> Result<bool, CacheError> {
        self.store
            .extend_lock(guard.job_id, &guard.token, self.ttl)
            .await
    }

    /// Release; failures are logged only, the TTL bounds how long a stuck
    /// record can block others.
    pub async fn release(&self, guard: LockGuard) {
        match self.store.release_lock(guard.job_id, &guard.token).await {
            Ok(true) => debug!(job_id = %guard.job_id, "job lock released"),
            Ok(false) => warn!(
                job_id = %guard.job_id,
                "job lock expired before release"
            ),
            Err(e) => warn!(
                job_id = %guard.job_id,
                error = %e,
                "failed to release job lock"
            ),
        }
    }
}
