//! Postgres and Redis backends against real containers.
//!
//! Requires Docker: `cargo test --test backend_integration_tests -- --ignored`

mod common;

use std::sync::Arc;
use std::time::Duration;

use research_core::common::{JobId, SubjectId, SystemClock};
use research_core::domains::research::{
    CheckpointPatch, CheckpointStore, JobStatus, JobStore, Phase, PostgresCheckpointRepository,
    PostgresJobStore, ResearchJob,
};
use research_core::kernel::{JobLock, LockStore, ProgressCache, ProgressSnapshot, RedisJobCache};
use test_context::test_context;

use crate::common::TestHarness;

async fn insert_running_job(store: &PostgresJobStore) -> ResearchJob {
    let now = chrono::Utc::now();
    let mut job = ResearchJob::pending(SubjectId::new(), chrono::Duration::hours(1), now);
    store.insert(&job).await.expect("insert job");
    job.mark_started(now).unwrap();
    store.update(&job).await.expect("update job");
    job
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_job_rows_round_trip(ctx: &mut TestHarness) {
    let store = PostgresJobStore::new(ctx.db_pool.clone());
    let mut job = insert_running_job(&store).await;

    let found = store.find(job.id).await.unwrap().expect("job row");
    assert_eq!(found.status, JobStatus::InProgress);
    assert_eq!(found.phase, Phase::Crawl);

    let now = chrono::Utc::now();
    job.mark_paused(now).unwrap();
    store.update(&job).await.unwrap();
    let found = store.find(job.id).await.unwrap().expect("job row");
    assert_eq!(found.status, JobStatus::Paused);
    assert!(found.paused_at.is_some());

    let paused = store.list_by_status(JobStatus::Paused).await.unwrap();
    assert!(paused.iter().any(|j| j.id == job.id));
    assert!(store.find(JobId::new()).await.unwrap().is_none());
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_checkpoint_save_merges_into_stored_record(ctx: &mut TestHarness) {
    let jobs = PostgresJobStore::new(ctx.db_pool.clone());
    let job = insert_running_job(&jobs).await;
    let store = CheckpointStore::new(
        Arc::new(PostgresCheckpointRepository::new(ctx.db_pool.clone())),
        Arc::new(SystemClock),
    );

    assert!(!store.can_resume(job.id).await.unwrap());

    let first = CheckpointPatch {
        work_items_done: Some(["a".to_string()].into_iter().collect()),
        work_items_queued: Some(["b".to_string(), "c".to_string()].into_iter().collect()),
        sub_step_counts: Some([("entities".to_string(), 1)].into_iter().collect()),
        ..Default::default()
    };
    store.save(job.id, first).await.unwrap();

    let second = CheckpointPatch {
        depth_reached: Some(3),
        sub_step_counts: Some([("pages".to_string(), 2)].into_iter().collect()),
        ..Default::default()
    };
    let saved = store.save(job.id, second).await.unwrap();

    let loaded = store.load(job.id).await.unwrap();
    assert_eq!(loaded, saved);
    assert_eq!(loaded.work_items_done.len(), 1);
    assert_eq!(loaded.work_items_queued.len(), 2);
    assert_eq!(loaded.depth_reached, 3);
    assert_eq!(loaded.count("entities"), 1);
    assert_eq!(loaded.count("pages"), 2);
    assert!(loaded.last_checkpoint_time.is_some());

    assert!(store.can_resume(job.id).await.unwrap());
    assert_eq!(store.resume_phase(job.id).await.unwrap(), Phase::Crawl);

    store.clear(job.id).await.unwrap();
    assert!(!store.can_resume(job.id).await.unwrap());
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_lock_is_exclusive_and_expires(ctx: &mut TestHarness) {
    let cache = Arc::new(RedisJobCache::connect(&ctx.redis_url).await.unwrap());
    let job_id = JobId::new();

    assert!(cache.acquire_lock(job_id, "a", Duration::from_secs(30)).await.unwrap());
    assert!(!cache.acquire_lock(job_id, "b", Duration::from_secs(30)).await.unwrap());
    assert!(!cache.release_lock(job_id, "b").await.unwrap());
    assert!(cache.extend_lock(job_id, "a", Duration::from_millis(200)).await.unwrap());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(cache.acquire_lock(job_id, "b", Duration::from_secs(30)).await.unwrap());
    assert!(!cache.release_lock(job_id, "a").await.unwrap());
    assert!(cache.release_lock(job_id, "b").await.unwrap());

    let lock = JobLock::new(cache.clone(), Duration::from_secs(30));
    let guard = lock.try_acquire(job_id).await.unwrap().expect("free lock");
    assert!(lock.try_acquire(job_id).await.unwrap().is_none());
    lock.release(guard).await;
    assert!(lock.try_acquire(job_id).await.unwrap().is_some());
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_progress_round_trip(ctx: &mut TestHarness) {
    let cache = RedisJobCache::connect(&ctx.redis_url).await.unwrap();
    let job_id = JobId::new();
    assert!(cache.get_progress(job_id).await.unwrap().is_none());

    let snapshot = ProgressSnapshot {
        phase: Phase::Crawl,
        percent_complete: 25.0,
        current_activity: Some("Fetching".to_string()),
        counts: [("work_items_done".to_string(), 5)].into_iter().collect(),
        updated_at: chrono::Utc::now(),
    };
    cache.set_progress(job_id, &snapshot).await.unwrap();
    cache.set_activity(job_id, "Fetching page 6").await.unwrap();

    let stored = cache.get_progress(job_id).await.unwrap().expect("snapshot");
    assert_eq!(stored.count("work_items_done"), 5);
    assert_eq!(stored.phase, Phase::Crawl);
    assert_eq!(
        cache.get_activity(job_id).await.unwrap().as_deref(),
        Some("Fetching page 6")
    );
}
