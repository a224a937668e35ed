//! In-memory orchestrator fixture.
//!
//! Every backend is in memory and time only moves through the shared
//! `ManualClock`, so tests control lock expiry, staleness and budgets exactly.

use std::sync::Arc;
use std::time::Duration;

use research_core::common::{JobId, SubjectId};
use research_core::domains::research::testing::{pipeline, ItemExecutor};
use research_core::domains::research::{
    Checkpoint, JobOrchestrator, JobStatus, PhaseRegistry, ResearchJob,
};
use research_core::kernel::TestDeps;
use research_core::JobSettings;

/// Initialize tracing once, respecting RUST_LOG.
/// Run tests with: RUST_LOG=debug cargo test -- --nocapture
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_settings() -> JobSettings {
    JobSettings {
        pause_wait_timeout: Duration::from_secs(5),
        ..JobSettings::default()
    }
}

pub struct Fixture {
    pub backends: TestDeps,
    pub crawl: Arc<ItemExecutor>,
    pub orchestrator: JobOrchestrator,
}

impl Fixture {
    /// Full pipeline with `crawl` as the first phase.
    pub fn new(crawl: ItemExecutor) -> Self {
        Self::with_settings(crawl, test_settings())
    }

    pub fn with_settings(crawl: ItemExecutor, settings: JobSettings) -> Self {
        let crawl = Arc::new(crawl);
        let registry = pipeline(crawl.clone());
        Self::with_registry(crawl, registry, settings)
    }

    pub fn with_registry(
        crawl: Arc<ItemExecutor>,
        registry: PhaseRegistry,
        settings: JobSettings,
    ) -> Self {
        init_tracing();
        let backends = TestDeps::with_settings(settings);
        let orchestrator = JobOrchestrator::new(backends.deps(), registry);
        Self {
            backends,
            crawl,
            orchestrator,
        }
    }

    /// Create and start a job with the default budget.
    pub async fn started_job(&self) -> ResearchJob {
        let job = self
            .orchestrator
            .create_job(SubjectId::new(), None)
            .await
            .expect("create job");
        self.orchestrator.start(job.id).await.expect("start job")
    }

    pub fn job(&self, job_id: JobId) -> ResearchJob {
        self.backends.jobs.get(job_id).expect("job row")
    }

    /// The stored checkpoint, decoded.
    pub fn checkpoint(&self, job_id: JobId) -> Checkpoint {
        self.backends
            .checkpoints
            .raw(job_id)
            .map(|raw| Checkpoint::decode(&raw).expect("readable checkpoint"))
            .unwrap_or_default()
    }

    /// Poll until the job reaches `status` (up to five seconds).
    pub async fn wait_for_status(&self, job_id: JobId, status: JobStatus) -> ResearchJob {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let job = self.job(job_id);
            if job.status == status {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} stuck in {} waiting for {}",
                job_id,
                job.status,
                status
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll until the stored checkpoint satisfies `ready` (up to five seconds).
    pub async fn wait_for_checkpoint<F>(&self, job_id: JobId, ready: F) -> Checkpoint
    where
        F: Fn(&Checkpoint) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let checkpoint = self.checkpoint(job_id);
            if ready(&checkpoint) {
                return checkpoint;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "checkpoint for {} never reached the expected state: {:?}",
                job_id,
                checkpoint
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll until no worker for the job runs in this process.
    pub async fn wait_until_idle(&self, job_id: JobId) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.orchestrator.is_running(job_id) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "worker for {} never stopped",
                job_id
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
