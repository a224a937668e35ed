// In-memory backends for tests
//
// Stand-ins for Postgres and Redis that can be switched into failure modes,
// plus `TestDeps`, which wires them into a `JobDeps` around a `ManualClock`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::deps::JobDeps;
use super::progress_cache::{CacheError, LockStore, ProgressCache, ProgressSnapshot};
use crate::common::{to_chrono, Clock, JobId, ManualClock};
use crate::config::JobSettings;
use crate::domains::research::{CheckpointRepository, JobStatus, JobStore, ResearchJob};

// =============================================================================
// Job rows
// =============================================================================

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, ResearchJob>>,
    fail_updates: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a row directly, bypassing the orchestrator.
    pub fn put(&self, job: ResearchJob) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    pub fn get(&self, job_id: JobId) -> Option<ResearchJob> {
        self.jobs.lock().unwrap().get(&job_id).cloned()
    }

    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &ResearchJob) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.id) {
            bail!("research job {} already exists", job.id);
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn find(&self, job_id: JobId) -> Result<Option<ResearchJob>> {
        Ok(self.get(job_id))
    }

    async fn update(&self, job: &ResearchJob) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            bail!("database unavailable");
        }
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job.id) {
            Some(row) => {
                *row = job.clone();
                Ok(())
            }
            None => bail!("research job {} disappeared during update", job.id),
        }
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ResearchJob>> {
        let mut jobs: Vec<ResearchJob> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}

// =============================================================================
// Checkpoint records
// =============================================================================

#[derive(Default)]
pub struct InMemoryCheckpointRepository {
    records: Mutex<HashMap<JobId, Value>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl InMemoryCheckpointRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw record as-is (e.g. an old-schema or corrupt blob).
    pub fn put_raw(&self, job_id: JobId, record: Value) {
        self.records.lock().unwrap().insert(job_id, record);
    }

    pub fn raw(&self, job_id: JobId) -> Option<Value> {
        self.records.lock().unwrap().get(&job_id).cloned()
    }

    /// Successful writes so far, across all jobs.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointRepository for InMemoryCheckpointRepository {
    async fn read(&self, job_id: JobId) -> Result<Option<Value>> {
        Ok(self.raw(job_id))
    }

    async fn write(&self, job_id: JobId, checkpoint: &Value, _version: i32) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("database unavailable");
        }
        self.records
            .lock()
            .unwrap()
            .insert(job_id, checkpoint.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Progress cache + locks
// =============================================================================

/// Lock expiry follows the injected clock, so TTL tests advance a
/// `ManualClock` instead of sleeping.
pub struct InMemoryJobCache {
    clock: Arc<dyn Clock>,
    progress: Mutex<HashMap<JobId, ProgressSnapshot>>,
    activity: Mutex<HashMap<JobId, String>>,
    locks: Mutex<HashMap<JobId, (String, DateTime<Utc>)>>,
    progress_down: AtomicBool,
    locks_down: AtomicBool,
}

impl InMemoryJobCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            progress: Mutex::new(HashMap::new()),
            activity: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            progress_down: AtomicBool::new(false),
            locks_down: AtomicBool::new(false),
        }
    }

    /// Simulate the progress keys being unreachable.
    pub fn set_progress_down(&self, down: bool) {
        self.progress_down.store(down, Ordering::SeqCst);
    }

    /// Simulate the lock keys being unreachable.
    pub fn set_locks_down(&self, down: bool) {
        self.locks_down.store(down, Ordering::SeqCst);
    }

    /// Current unexpired holder token, if any.
    pub fn lock_holder(&self, job_id: JobId) -> Option<String> {
        let now = self.clock.now();
        self.locks
            .lock()
            .unwrap()
            .get(&job_id)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(token, _)| token.clone())
    }

    fn check_progress(&self) -> Result<(), CacheError> {
        if self.progress_down.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("progress cache offline".into()));
        }
        Ok(())
    }

    fn check_locks(&self) -> Result<(), CacheError> {
        if self.locks_down.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("lock store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressCache for InMemoryJobCache {
    async fn set_progress(
        &self,
        job_id: JobId,
        snapshot: &ProgressSnapshot,
    ) -> Result<(), CacheError> {
        self.check_progress()?;
        self.progress
            .lock()
            .unwrap()
            .insert(job_id, snapshot.clone());
        Ok(())
    }

    async fn get_progress(&self, job_id: JobId) -> Result<Option<ProgressSnapshot>, CacheError> {
        self.check_progress()?;
        Ok(self.progress.lock().unwrap().get(&job_id).cloned())
    }

    async fn set_activity(&self, job_id: JobId, text: &str) -> Result<(), CacheError> {
        self.check_progress()?;
        self.activity
            .lock()
            .unwrap()
            .insert(job_id, text.to_string());
        Ok(())
    }

    async fn get_activity(&self, job_id: JobId) -> Result<Option<String>, CacheError> {
        self.check_progress()?;
        Ok(self.activity.lock().unwrap().get(&job_id).cloned())
    }
}

#[async_trait]
impl LockStore for InMemoryJobCache {
    async fn acquire_lock(
        &self,
        job_id: JobId,
        holder_token: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.check_locks()?;
        let now = self.clock.now();
        let mut locks = self.locks.lock().unwrap();
        let free = match locks.get(&job_id) {
            None => true,
            Some((token, expires_at)) => token == holder_token || *expires_at <= now,
        };
        if free {
            locks.insert(job_id, (holder_token.to_string(), now + to_chrono(ttl)));
        }
        Ok(free)
    }

    async fn release_lock(&self, job_id: JobId, holder_token: &str) -> Result<bool, CacheError> {
        self.check_locks()?;
        let now = self.clock.now();
        let mut locks = self.locks.lock().unwrap();
        let held = locks
            .get(&job_id)
            .is_some_and(|(token, expires_at)| token == holder_token && *expires_at > now);
        if held {
            locks.remove(&job_id);
        }
        Ok(held)
    }

    async fn extend_lock(
        &self,
        job_id: JobId,
        holder_token: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.check_locks()?;
        let now = self.clock.now();
        let mut locks = self.locks.lock().unwrap();
        match locks.get_mut(&job_id) {
            Some((token, expires_at)) if token == holder_token && *expires_at > now => {
                *expires_at = now + to_chrono(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// =============================================================================
// Wiring
// =============================================================================

/// In-memory backends sharing one manual clock.
pub struct TestDeps {
    pub clock: Arc<ManualClock>,
    pub jobs: Arc<InMemoryJobStore>,
    pub checkpoints: Arc<InMemoryCheckpointRepository>,
    pub cache: Arc<InMemoryJobCache>,
    pub settings: JobSettings,
}

impl TestDeps {
    pub fn new() -> Self {
        Self::with_settings(JobSettings {
            pause_wait_timeout: Duration::from_secs(5),
            ..JobSettings::default()
        })
    }

    pub fn with_settings(settings: JobSettings) -> Self {
        let clock = Arc::new(ManualClock::default());
        Self {
            jobs: Arc::new(InMemoryJobStore::new()),
            checkpoints: Arc::new(InMemoryCheckpointRepository::new()),
            cache: Arc::new(InMemoryJobCache::new(clock.clone())),
            clock,
            settings,
        }
    }

    pub fn deps(&self) -> JobDeps {
        JobDeps::new(
            self.jobs.clone(),
            self.checkpoints.clone(),
            self.cache.clone(),
            self.cache.clone(),
            self.clock.clone(),
            self.settings.clone(),
        )
    }
}

impl Default for TestDeps {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_exclusive_until_expiry() {
        let clock = Arc::new(ManualClock::default());
        let cache = InMemoryJobCache::new(clock.clone());
        let job_id = JobId::new();
        let ttl = Duration::from_secs(60);

        assert!(cache.acquire_lock(job_id, "a", ttl).await.unwrap());
        assert!(!cache.acquire_lock(job_id, "b", ttl).await.unwrap());

        clock.advance(chrono::Duration::seconds(61));
        assert!(cache.acquire_lock(job_id, "b", ttl).await.unwrap());
        assert!(!cache.release_lock(job_id, "a").await.unwrap());
        assert_eq!(cache.lock_holder(job_id).as_deref(), Some("b"));
    }
}
