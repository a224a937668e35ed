//! Startup recovery of jobs orphaned by a previous process.
//!
//! There is no clean "shutting down" transition, so every IN_PROGRESS job at
//! boot is presumed orphaned. Stale ones are failed with their checkpoint
//! kept; the rest continue from their checkpoint or start over. A job still
//! locked by the previous process is recovered once that lock expires.

use std::sync::atomic::Ordering;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::{JobError, JobResult};
use super::models::{Checkpoint, CheckpointPatch, FailureKind, JobStatus, Phase};
use super::orchestrator::JobOrchestrator;
use crate::common::JobId;

/// What one recovery pass did with each IN_PROGRESS job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub failed_stale: Vec<JobId>,
    pub resumed: Vec<JobId>,
    pub restarted: Vec<JobId>,
    /// Locked for longer than one lock TTL, already running here, or not
    /// recoverable.
    pub skipped: Vec<JobId>,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.failed_stale.len() + self.resumed.len() + self.restarted.len() + self.skipped.len()
    }
}

enum Recovered {
    FailedStale,
    Resumed,
    Restarted,
    Skipped,
}

impl JobOrchestrator {
    /// Boot hook: recovers orphaned jobs unless disabled in settings.
    pub async fn startup(&self) -> JobResult<RecoveryReport> {
        if !self.inner.deps.settings.recover_on_startup {
            info!("startup recovery disabled");
            return Ok(RecoveryReport::default());
        }
        self.recover_on_startup().await
    }

    /// Runs once per orchestrator; later calls return an empty report.
    pub async fn recover_on_startup(&self) -> JobResult<RecoveryReport> {
        if self.inner.recovered.swap(true, Ordering::SeqCst) {
            debug!("recovery already ran in this process");
            return Ok(RecoveryReport::default());
        }

        let jobs = match self.inner.deps.jobs.list_by_status(JobStatus::InProgress).await {
            Ok(jobs) => jobs,
            Err(e) => {
                // Let a later call try again.
                self.inner.recovered.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        info!(count = jobs.len(), "recovering in-progress research jobs");

        let outcomes = join_all(jobs.iter().map(|job| self.recover_job(job.id))).await;

        let mut report = RecoveryReport::default();
        for (job, outcome) in jobs.iter().zip(outcomes) {
            let job_id = job.id;
            match outcome {
                Ok(Recovered::FailedStale) => report.failed_stale.push(job_id),
                Ok(Recovered::Resumed) => report.resumed.push(job_id),
                Ok(Recovered::Restarted) => report.restarted.push(job_id),
                Ok(Recovered::Skipped) => report.skipped.push(job_id),
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "job recovery failed, skipping");
                    report.skipped.push(job_id);
                }
            }
        }

        info!(
            failed_stale = report.failed_stale.len(),
            resumed = report.resumed.len(),
            restarted = report.restarted.len(),
            skipped = report.skipped.len(),
            "recovery finished"
        );
        Ok(report)
    }

    async fn recover_job(&self, job_id: JobId) -> JobResult<Recovered> {
        if self.is_running(job_id) {
            return Ok(Recovered::Skipped);
        }
        // A lock left behind by a crashed holder expires within one TTL.
        let guard = match self.lock_internal(job_id, None).await {
            Ok(guard) => guard,
            Err(JobError::LockHeld(_)) => {
                debug!(job_id = %job_id, "job still locked after one lock TTL, skipping recovery");
                return Ok(Recovered::Skipped);
            }
            Err(e) => return Err(e),
        };
        let result = self.recover_locked(job_id).await;
        self.inner.lock.release(guard).await;
        result
    }

    async fn recover_locked(&self, job_id: JobId) -> JobResult<Recovered> {
        let mut job = self.load_job(job_id).await?;
        if job.status != JobStatus::InProgress || self.is_running(job_id) {
            return Ok(Recovered::Skipped);
        }

        if self.is_stale(&job).await {
            self.fail_locked(job, FailureKind::Stale, "stale on recovery".to_string(), true)
                .await?;
            return Ok(Recovered::FailedStale);
        }

        let now = self.now();
        let checkpoints = &self.inner.deps.checkpoints;

        if checkpoints.can_resume(job_id).await? {
            let point = checkpoints.resume_point(job_id).await?;
            if point.phase == Phase::Completed {
                job.mark_completed(now)?;
                self.inner.deps.jobs.update(&job).await?;
                info!(job_id = %job_id, "recovered job had every phase done, completed");
                return Ok(Recovered::Resumed);
            }
            job.enter_phase(point.phase, now)?;
            self.inner.deps.jobs.update(&job).await?;
            info!(
                job_id = %job_id,
                phase = %point.phase,
                work_items_done = point.checkpoint.work_items_done.len(),
                "recovered job resuming from checkpoint"
            );
            self.dispatch(&job, point.phase, point.checkpoint);
            return Ok(Recovered::Resumed);
        }

        // Nothing usable: back to the start of the pipeline.
        job.enter_phase(Phase::Queued, now)?;
        self.inner.deps.jobs.update(&job).await?;

        let mut state = Checkpoint::default();
        state.begin_phase(now);
        checkpoints.clear(job_id).await?;
        let state = checkpoints.save(job_id, CheckpointPatch::from(&state)).await?;

        job.enter_phase(Phase::first(), now)?;
        self.inner.deps.jobs.update(&job).await?;
        info!(job_id = %job_id, "recovered job restarting from the first phase");
        self.dispatch(&job, Phase::first(), state);
        Ok(Recovered::Restarted)
    }
}
