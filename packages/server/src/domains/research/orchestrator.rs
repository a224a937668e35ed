//! Job Orchestrator: the research job state machine.
//!
//! Every state change happens while holding the job's distributed lock.
//! Control requests (pause, resume, start) try the lock once and report a
//! conflict if it is held; the orchestrator's own transitions and startup
//! recovery retry for up to one lock TTL. An operation that waits on a worker
//! while holding the lock refreshes it afterwards and gives up if it was lost.
//!
//! Each IN_PROGRESS job runs as one tokio task that executes the pipeline
//! phases in order. The task never changes job status directly while a stop
//! is pending; whoever requested the stop persists its working state.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::PhaseContext;
use super::control::{PauseOutcome, ResumeOutcome, ResumedFrom};
use super::error::{JobError, JobResult};
use super::models::{
    next_phase, Checkpoint, CheckpointPatch, FailureKind, JobStatus, Phase, ResearchJob,
    ENTITIES_COUNTER,
};
use super::phases::{PhaseOutcome, PhaseRegistry};
use super::worker::{
    lock_state, ActiveWorkers, Budget, Registered, StopReason, StoppedWorker, WorkerHandle,
};
use crate::common::{to_chrono, JobId, SubjectId};
use crate::kernel::{JobDeps, JobLock, LockGuard};

/// First wait before a worker retries a phase transition it could not lock.
const TRANSITION_RETRY_BACKOFF: StdDuration = StdDuration::from_millis(100);
/// Attempts before a worker gives up on a blocked transition.
const TRANSITION_RETRY_ATTEMPTS: u32 = 8;

/// Result of finishing a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The job moved on to this phase.
    Continue(Phase),
    /// That was the last phase; the job is COMPLETED.
    Completed,
    /// The time budget ran out; the job is FAILED with kind TIMEOUT.
    TimedOut,
}

#[derive(Clone)]
pub struct JobOrchestrator {
    pub(super) inner: Arc<Inner>,
}

pub(super) struct Inner {
    pub(super) deps: JobDeps,
    pub(super) lock: JobLock,
    pub(super) registry: PhaseRegistry,
    pub(super) workers: ActiveWorkers,
    pub(super) recovered: AtomicBool,
}

impl JobOrchestrator {
    pub fn new(deps: JobDeps, registry: PhaseRegistry) -> Self {
        let lock = JobLock::new(deps.locks.clone(), deps.settings.lock_ttl);
        Self {
            inner: Arc::new(Inner {
                deps,
                lock,
                registry,
                workers: ActiveWorkers::default(),
                recovered: AtomicBool::new(false),
            }),
        }
    }

    pub fn deps(&self) -> &JobDeps {
        &self.inner.deps
    }

    /// True while a worker task for the job runs in this process.
    pub fn is_running(&self, job_id: JobId) -> bool {
        self.inner.workers.is_running(job_id)
    }

    // ========================================================================
    // Creation and reads
    // ========================================================================

    /// Insert a PENDING job. `None` uses the configured default budget.
    pub async fn create_job(
        &self,
        reference_id: SubjectId,
        time_budget: Option<Duration>,
    ) -> JobResult<ResearchJob> {
        let budget = time_budget
            .unwrap_or_else(|| to_chrono(self.inner.deps.settings.default_time_budget));
        let job = ResearchJob::pending(reference_id, budget, self.now());
        self.inner.deps.jobs.insert(&job).await?;
        info!(
            job_id = %job.id,
            reference_id = %reference_id,
            time_budget_secs = job.time_budget_secs,
            "research job created"
        );
        Ok(job)
    }

    pub async fn get_job(&self, job_id: JobId) -> JobResult<ResearchJob> {
        self.load_job(job_id).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// PENDING → IN_PROGRESS with a fresh checkpoint; dispatches the first phase.
    pub async fn start(&self, job_id: JobId) -> JobResult<ResearchJob> {
        self.load_job(job_id)
            .await?
            .require_status(JobStatus::Pending, "start")?;

        let guard = self.lock_for_control(job_id).await?;
        let result = self.start_locked(job_id).await;
        self.inner.lock.release(guard).await;
        result
    }

    async fn start_locked(&self, job_id: JobId) -> JobResult<ResearchJob> {
        let mut job = self.load_job(job_id).await?;
        let now = self.now();
        job.mark_started(now)?;

        let mut state = Checkpoint::default();
        state.begin_phase(now);
        self.inner.deps.checkpoints.clear(job_id).await?;
        let state = self
            .inner
            .deps
            .checkpoints
            .save(job_id, CheckpointPatch::from(&state))
            .await?;
        self.inner.deps.jobs.update(&job).await?;

        self.report_activity(job_id, "Starting").await;
        info!(job_id = %job_id, phase = %job.phase, "research job started");
        self.dispatch(&job, job.phase, state);
        Ok(job)
    }

    /// A fresh run for the subject of a finished job. The old job is untouched.
    pub async fn rescan(&self, job_id: JobId) -> JobResult<ResearchJob> {
        let previous = self.load_job(job_id).await?;
        let job = previous.rescan(self.now())?;
        self.inner.deps.jobs.insert(&job).await?;
        info!(
            job_id = %job.id,
            previous_job_id = %job_id,
            reference_id = %job.reference_id,
            "research job rescan created"
        );
        self.start(job.id).await
    }

    /// Record the current phase as finished and move to `next`.
    ///
    /// `next` must be the pipeline successor of the job's phase
    /// (`Phase::Completed` after the last one). A worker for the job in this
    /// process is superseded and its working state carried over.
    pub async fn transition_phase(&self, job_id: JobId, next: Phase) -> JobResult<Transition> {
        let guard = self.lock_internal(job_id, None).await?;
        let result = self.transition_phase_locked(job_id, next, &guard).await;
        self.inner.lock.release(guard).await;
        result
    }

    async fn transition_phase_locked(
        &self,
        job_id: JobId,
        next: Phase,
        guard: &LockGuard,
    ) -> JobResult<Transition> {
        let job = self.load_job(job_id).await?;
        job.require_status(JobStatus::InProgress, "phase transition")?;
        let expected = next_phase(job.phase).unwrap_or(Phase::Completed);
        if next != expected {
            return Err(JobError::UnexpectedPhase {
                job_id,
                current: job.phase,
                requested: next,
            });
        }

        let state = match self
            .inner
            .workers
            .stop(
                job_id,
                StopReason::Superseded,
                self.inner.deps.settings.pause_wait_timeout,
            )
            .await
        {
            Some(stopped) => {
                if let Err(e) = self.confirm_lock(guard).await {
                    self.redispatch(&job, Some(stopped));
                    return Err(e);
                }
                stopped.state
            }
            None => self.inner.deps.checkpoints.load(job_id).await?,
        };

        let finished = job.phase;
        let (transition, state) = self.finish_phase_locked(job, finished, state).await?;
        if let Transition::Continue(phase) = transition {
            let job = self.load_job(job_id).await?;
            self.dispatch(&job, phase, state);
        }
        Ok(transition)
    }

    /// IN_PROGRESS → COMPLETED.
    pub async fn complete(&self, job_id: JobId) -> JobResult<ResearchJob> {
        let guard = self.lock_internal(job_id, None).await?;
        let result = self.complete_locked(job_id).await;
        self.inner.lock.release(guard).await;
        result
    }

    async fn complete_locked(&self, job_id: JobId) -> JobResult<ResearchJob> {
        let mut job = self.load_job(job_id).await?;
        job.mark_completed(self.now())?;
        self.inner.deps.jobs.update(&job).await?;
        self.inner.workers.signal(job_id, StopReason::Superseded);

        self.report_activity(job_id, "Completed").await;
        info!(job_id = %job_id, "research job completed");
        Ok(job)
    }

    /// Any non-terminal status → FAILED. The checkpoint is cleared unless
    /// `preserve_progress` is set.
    pub async fn fail(
        &self,
        job_id: JobId,
        reason: impl Into<String>,
        preserve_progress: bool,
    ) -> JobResult<ResearchJob> {
        let reason = reason.into();
        let guard = self.lock_internal(job_id, None).await?;
        let result = async {
            let job = self.load_job(job_id).await?;
            let job = self
                .fail_locked(job, FailureKind::Error, reason, preserve_progress)
                .await?;
            self.inner.workers.signal(job_id, StopReason::Failed);
            Ok(job)
        }
        .await;
        self.inner.lock.release(guard).await;
        result
    }

    pub(super) async fn fail_locked(
        &self,
        mut job: ResearchJob,
        kind: FailureKind,
        reason: String,
        preserve_progress: bool,
    ) -> JobResult<ResearchJob> {
        job.mark_failed(kind, reason.clone(), self.now())?;
        self.inner.deps.jobs.update(&job).await?;
        if !preserve_progress {
            self.inner.deps.checkpoints.clear(job.id).await?;
        }

        self.report_activity(job.id, &format!("Stopped: {}", reason))
            .await;
        match kind {
            FailureKind::Error => error!(
                job_id = %job.id,
                phase = %job.phase,
                reason = %reason,
                preserve_progress,
                "research job failed"
            ),
            FailureKind::Timeout | FailureKind::Stale => warn!(
                job_id = %job.id,
                phase = %job.phase,
                failure_kind = ?kind,
                reason = %reason,
                "research job ended with partial results"
            ),
        }
        Ok(job)
    }

    // ========================================================================
    // Pause / Resume
    // ========================================================================

    /// Stop the worker between units of work, persist its state, and mark
    /// the job PAUSED.
    ///
    /// If the checkpoint cannot be persisted the job stays IN_PROGRESS, the
    /// worker is re-dispatched, and the error is returned.
    pub async fn pause(&self, job_id: JobId) -> JobResult<PauseOutcome> {
        self.load_job(job_id)
            .await?
            .require_status(JobStatus::InProgress, "pause")?;

        let guard = self.lock_for_control(job_id).await?;
        let result = self.pause_locked(job_id, &guard).await;
        self.inner.lock.release(guard).await;
        result
    }

    async fn pause_locked(&self, job_id: JobId, guard: &LockGuard) -> JobResult<PauseOutcome> {
        let mut job = self.load_job(job_id).await?;
        job.require_status(JobStatus::InProgress, "pause")?;

        let stopped = self
            .inner
            .workers
            .stop(
                job_id,
                StopReason::Pause,
                self.inner.deps.settings.pause_wait_timeout,
            )
            .await;
        if let Err(e) = self.confirm_lock(guard).await {
            warn!(job_id = %job_id, error = %e, "lock lost while waiting for the worker, pause abandoned");
            self.redispatch(&job, stopped);
            return Err(e);
        }
        let patch = stopped
            .as_ref()
            .map(|s| CheckpointPatch::from(&s.state))
            .unwrap_or_default();

        let saved = match self.inner.deps.checkpoints.save(job_id, patch).await {
            Ok(saved) => saved,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "pause checkpoint failed, job keeps running");
                self.redispatch(&job, stopped);
                return Err(e);
            }
        };

        let now = self.now();
        job.mark_paused(now)?;
        if let Err(e) = self.inner.deps.jobs.update(&job).await {
            error!(job_id = %job_id, error = %e, "pause status update failed, job keeps running");
            self.redispatch(&job, stopped);
            return Err(e.into());
        }

        self.report_activity(job_id, "Paused").await;
        info!(
            job_id = %job_id,
            phase = %job.phase,
            work_items_done = saved.work_items_done.len(),
            worker_exited = stopped.as_ref().map_or(true, |s| s.exited),
            "research job paused"
        );

        Ok(PauseOutcome {
            status: job.status,
            checkpoint_saved: true,
            paused_at: now,
        })
    }

    /// PAUSED → IN_PROGRESS at the checkpoint's resume point.
    ///
    /// An unreadable checkpoint restarts the pipeline from the first phase.
    pub async fn resume(&self, job_id: JobId) -> JobResult<ResumeOutcome> {
        self.load_job(job_id)
            .await?
            .require_status(JobStatus::Paused, "resume")?;

        let guard = self.lock_for_control(job_id).await?;
        let result = self.resume_locked(job_id).await;
        self.inner.lock.release(guard).await;
        result
    }

    async fn resume_locked(&self, job_id: JobId) -> JobResult<ResumeOutcome> {
        let mut job = self.load_job(job_id).await?;
        job.require_status(JobStatus::Paused, "resume")?;

        let point = match self.inner.deps.checkpoints.resume_point(job_id).await {
            Ok(point) => point,
            Err(JobError::CorruptCheckpoint { reason, .. }) => {
                warn!(job_id = %job_id, reason = %reason, "checkpoint unreadable, restarting from the first phase");
                self.inner.deps.checkpoints.clear(job_id).await?;
                self.inner
                    .deps
                    .checkpoints
                    .resume_point(job_id)
                    .await?
            }
            Err(e) => return Err(e),
        };

        let now = self.now();
        let paused_for = job.mark_resumed(now)?;
        let resumed_from = ResumedFrom {
            work_items_done_count: point.checkpoint.work_items_done.len(),
            entities_count: point.checkpoint.count(ENTITIES_COUNTER),
            phase: point.phase,
        };

        if point.phase == Phase::Completed {
            job.mark_completed(now)?;
            self.inner.deps.jobs.update(&job).await?;
            info!(job_id = %job_id, "resumed job had no phases left, completed");
            return Ok(ResumeOutcome {
                status: job.status,
                resumed_from,
            });
        }

        job.enter_phase(point.phase, now)?;
        self.inner.deps.jobs.update(&job).await?;

        self.report_activity(job_id, "Resuming").await;
        info!(
            job_id = %job_id,
            phase = %point.phase,
            work_items_done = resumed_from.work_items_done_count,
            paused_secs = paused_for.num_seconds(),
            "research job resumed"
        );
        self.dispatch(&job, point.phase, point.checkpoint);

        Ok(ResumeOutcome {
            status: job.status,
            resumed_from,
        })
    }

    // ========================================================================
    // Timeouts
    // ========================================================================

    /// Stop the worker, keep every partial result, and mark the job FAILED
    /// with kind TIMEOUT.
    pub async fn handle_timeout(&self, job_id: JobId) -> JobResult<ResearchJob> {
        let guard = self.lock_internal(job_id, None).await?;
        let result = async {
            let job = self.load_job(job_id).await?;
            job.require_status(JobStatus::InProgress, "timeout")?;
            let stopped = self
                .inner
                .workers
                .stop(
                    job_id,
                    StopReason::Timeout,
                    self.inner.deps.settings.pause_wait_timeout,
                )
                .await;
            if let Err(e) = self.confirm_lock(&guard).await {
                warn!(job_id = %job_id, error = %e, "lock lost while waiting for the worker, timeout abandoned");
                return Err(e);
            }
            let patch = stopped
                .map(|s| CheckpointPatch::from(&s.state))
                .unwrap_or_default();
            self.time_out_locked(job, patch).await
        }
        .await;
        self.inner.lock.release(guard).await;
        result
    }

    /// Time the job out if it is running past its budget.
    pub async fn check_timeout(&self, job_id: JobId) -> JobResult<bool> {
        let job = self.load_job(job_id).await?;
        if job.status != JobStatus::InProgress || !job.budget_exceeded(self.now()) {
            return Ok(false);
        }
        self.handle_timeout(job_id).await?;
        Ok(true)
    }

    async fn time_out_locked(
        &self,
        job: ResearchJob,
        patch: CheckpointPatch,
    ) -> JobResult<ResearchJob> {
        self.inner.deps.checkpoints.save(job.id, patch).await?;
        let reason = format!(
            "time budget of {}s exceeded after {}s of active work",
            job.time_budget_secs,
            job.active_elapsed(self.now()).num_seconds()
        );
        self.fail_locked(job, FailureKind::Timeout, reason, true)
            .await
    }

    // ========================================================================
    // Staleness
    // ========================================================================

    /// No checkpoint or job update within the stale threshold.
    pub async fn is_stale(&self, job: &ResearchJob) -> bool {
        let last_checkpoint = match self.inner.deps.checkpoints.load(job.id).await {
            Ok(checkpoint) => checkpoint.last_checkpoint_time,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "checkpoint unavailable for staleness check");
                None
            }
        };
        let threshold = to_chrono(self.inner.deps.settings.stale_threshold);
        self.now() - last_activity(job, last_checkpoint) > threshold
    }

    // ========================================================================
    // Worker tasks
    // ========================================================================

    /// Spawn the job's worker at `phase` with `state`. False if one is
    /// already running here.
    pub(super) fn dispatch(&self, job: &ResearchJob, phase: Phase, state: Checkpoint) -> bool {
        let Some(Registered {
            handle,
            finished,
            previous,
        }) = self.inner.workers.register(job.id, state)
        else {
            warn!(job_id = %job.id, "worker already running, not dispatching another");
            return false;
        };

        let job_id = job.id;
        let budget = Budget::for_job(job);
        let this = self.clone();
        debug!(job_id = %job_id, phase = %phase, run_id = %handle.run_id, "dispatching worker");
        tokio::spawn(async move {
            if let Some(previous) = previous {
                debug!(job_id = %job_id, run_id = %previous.run_id, "waiting for the stopping worker to exit");
                previous.exited().await;
            }
            this.run_worker(job_id, phase, &handle, budget).await;
            this.inner.workers.remove(job_id, handle.run_id);
            let _ = finished.send(true);
        });
        true
    }

    fn redispatch(&self, job: &ResearchJob, stopped: Option<StoppedWorker>) {
        if let Some(stopped) = stopped {
            let phase = stopped.state.resume_phase();
            if phase == job.phase {
                self.dispatch(job, phase, stopped.state);
            } else {
                warn!(
                    job_id = %job.id,
                    "worker stopped at a phase boundary, leaving the job for recovery"
                );
            }
        }
    }

    async fn run_worker(&self, job_id: JobId, mut phase: Phase, handle: &WorkerHandle, budget: Budget) {
        info!(job_id = %job_id, phase = %phase, "worker started");

        let mut blocked_attempts = 0;
        loop {
            let already_done = lock_state(&handle.state).is_phase_complete(phase);
            let outcome = if already_done {
                Ok(PhaseOutcome::Completed)
            } else {
                let Some(executor) = self.inner.registry.get(phase) else {
                    let e = JobError::NoExecutor(phase);
                    error!(job_id = %job_id, error = %e, "cannot run phase");
                    self.fail_from_worker(job_id, handle, FailureKind::Error, e.to_string())
                        .await;
                    break;
                };
                lock_state(&handle.state).begin_phase(self.now());
                let mut ctx =
                    PhaseContext::new(job_id, phase, handle, budget, self.inner.deps.clone());
                executor.execute(&mut ctx).await
            };

            if let Some(reason) = handle.control.reason() {
                if matches!(outcome, Ok(PhaseOutcome::Completed)) {
                    lock_state(&handle.state).finish_phase(phase);
                }
                if reason == StopReason::BudgetExceeded {
                    self.time_out_from_worker(job_id, handle).await;
                }
                debug!(job_id = %job_id, phase = %phase, reason = ?reason, "worker stopping on request");
                break;
            }

            match outcome {
                Ok(PhaseOutcome::Completed) => match self.advance(job_id, phase, handle).await {
                    Ok(Transition::Continue(next)) => {
                        phase = next;
                        blocked_attempts = 0;
                    }
                    Ok(Transition::Completed) | Ok(Transition::TimedOut) => break,
                    Err(_) if handle.control.is_stop_requested() => {
                        lock_state(&handle.state).finish_phase(phase);
                        break;
                    }
                    Err(e @ (JobError::LockHeld(_) | JobError::LockUnavailable { .. }))
                        if blocked_attempts < TRANSITION_RETRY_ATTEMPTS =>
                    {
                        // Keep the finished phase durable, then come back
                        // through the loop and try the transition again.
                        blocked_attempts += 1;
                        let backoff = TRANSITION_RETRY_BACKOFF * 2u32.pow(blocked_attempts - 1);
                        warn!(
                            job_id = %job_id,
                            phase = %phase,
                            error = %e,
                            attempt = blocked_attempts,
                            retry_in_ms = backoff.as_millis() as u64,
                            "phase transition blocked"
                        );
                        lock_state(&handle.state).finish_phase(phase);
                        self.save_from_worker(job_id, handle).await;
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = handle.control.token().cancelled() => {}
                        }
                    }
                    Err(e) => {
                        error!(job_id = %job_id, phase = %phase, error = %e, "phase transition failed");
                        // A job that left IN_PROGRESS is someone else's to record.
                        if !matches!(e, JobError::InvalidState { .. } | JobError::NotFound(_)) {
                            lock_state(&handle.state).finish_phase(phase);
                            self.fail_from_worker(job_id, handle, FailureKind::Error, e.to_string())
                                .await;
                        }
                        break;
                    }
                },
                Ok(PhaseOutcome::Interrupted) => {
                    let reason = format!("phase {} stopped without a stop request", phase);
                    self.fail_from_worker(job_id, handle, FailureKind::Error, reason)
                        .await;
                    break;
                }
                Err(e) => {
                    let reason = format!("phase {} failed: {:#}", phase, e);
                    self.fail_from_worker(job_id, handle, FailureKind::Error, reason)
                        .await;
                    break;
                }
            }
        }

        info!(job_id = %job_id, "worker exited");
    }

    /// Move a worker's job past a finished phase under the lock.
    async fn advance(
        &self,
        job_id: JobId,
        finished: Phase,
        handle: &WorkerHandle,
    ) -> JobResult<Transition> {
        let guard = self.lock_internal(job_id, Some(handle.control.token())).await?;
        let result = async {
            let job = self.load_job(job_id).await?;
            let state = handle.snapshot();
            let (transition, state) = self.finish_phase_locked(job, finished, state).await?;
            *lock_state(&handle.state) = state;
            Ok(transition)
        }
        .await;
        self.inner.lock.release(guard).await;
        result
    }

    /// Persist `finished` as done, then start the next phase, complete the
    /// job, or time it out. Returns the new working state.
    async fn finish_phase_locked(
        &self,
        mut job: ResearchJob,
        finished: Phase,
        mut state: Checkpoint,
    ) -> JobResult<(Transition, Checkpoint)> {
        job.require_status(JobStatus::InProgress, "phase transition")?;
        let job_id = job.id;
        state.finish_phase(finished);
        let now = self.now();

        let next = match next_phase(finished) {
            Some(next) if next.is_working() => next,
            _ => {
                let state = self
                    .inner
                    .deps
                    .checkpoints
                    .save(job_id, CheckpointPatch::from(&state))
                    .await?;
                job.mark_completed(now)?;
                self.inner.deps.jobs.update(&job).await?;
                self.report_activity(job_id, "Completed").await;
                info!(job_id = %job_id, "research job completed");
                return Ok((Transition::Completed, state));
            }
        };

        if job.budget_exceeded(now) {
            self.time_out_locked(job, CheckpointPatch::from(&state))
                .await?;
            return Ok((Transition::TimedOut, state));
        }

        state.begin_phase(now);
        let state = self
            .inner
            .deps
            .checkpoints
            .save(job_id, CheckpointPatch::from(&state))
            .await?;
        job.enter_phase(next, now)?;
        self.inner.deps.jobs.update(&job).await?;

        self.report_activity(job_id, &format!("Starting {}", next.key()))
            .await;
        info!(job_id = %job_id, from = %finished, to = %next, "phase transition");
        Ok((Transition::Continue(next), state))
    }

    /// Persist the worker's state without the lock, like a periodic save.
    async fn save_from_worker(&self, job_id: JobId, handle: &WorkerHandle) {
        if handle.control.is_stop_requested() {
            return;
        }
        let result: JobResult<()> = async {
            let job = self.load_job(job_id).await?;
            if job.status != JobStatus::InProgress {
                return Ok(());
            }
            self.inner
                .deps
                .checkpoints
                .save(job_id, CheckpointPatch::from(&handle.snapshot()))
                .await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(job_id = %job_id, error = %e, "worker checkpoint failed");
        }
    }

    async fn fail_from_worker(
        &self,
        job_id: JobId,
        handle: &WorkerHandle,
        kind: FailureKind,
        reason: String,
    ) {
        let Some(guard) = self.lock_from_worker(job_id, handle).await else {
            return;
        };
        let result: JobResult<()> = async {
            let job = self.load_job(job_id).await?;
            if job.status != JobStatus::InProgress {
                return Ok(());
            }
            self.inner
                .deps
                .checkpoints
                .save(job_id, CheckpointPatch::from(&handle.snapshot()))
                .await?;
            self.fail_locked(job, kind, reason, true).await?;
            Ok(())
        }
        .await;
        self.inner.lock.release(guard).await;

        if let Err(e) = result {
            error!(job_id = %job_id, error = %e, "failed to record job failure");
        }
    }

    async fn time_out_from_worker(&self, job_id: JobId, handle: &WorkerHandle) {
        // The stop token is already cancelled, so retry without it.
        let guard = match self.lock_internal(job_id, None).await {
            Ok(guard) => guard,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "cannot lock job to record timeout");
                return;
            }
        };
        let result: JobResult<()> = async {
            let job = self.load_job(job_id).await?;
            if job.status != JobStatus::InProgress {
                return Ok(());
            }
            self.time_out_locked(job, CheckpointPatch::from(&handle.snapshot()))
                .await?;
            Ok(())
        }
        .await;
        self.inner.lock.release(guard).await;

        if let Err(e) = result {
            error!(job_id = %job_id, error = %e, "failed to record job timeout");
        }
    }

    async fn lock_from_worker(&self, job_id: JobId, handle: &WorkerHandle) -> Option<LockGuard> {
        if handle.control.is_stop_requested() {
            return None;
        }
        match self.lock_internal(job_id, Some(handle.control.token())).await {
            Ok(guard) => Some(guard),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "worker could not lock job");
                None
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    pub(super) fn now(&self) -> DateTime<Utc> {
        self.inner.deps.clock.now()
    }

    pub(super) async fn load_job(&self, job_id: JobId) -> JobResult<ResearchJob> {
        self.inner
            .deps
            .jobs
            .find(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))
    }

    /// Single attempt; a held lock is a conflict.
    pub(super) async fn lock_for_control(&self, job_id: JobId) -> JobResult<LockGuard> {
        match self.inner.lock.try_acquire(job_id).await {
            Ok(Some(guard)) => Ok(guard),
            Ok(None) => Err(JobError::LockHeld(job_id)),
            Err(source) => Err(JobError::LockUnavailable { job_id, source }),
        }
    }

    /// Retries for up to one lock TTL, or until `abort` fires.
    pub(super) async fn lock_internal(
        &self,
        job_id: JobId,
        abort: Option<&CancellationToken>,
    ) -> JobResult<LockGuard> {
        let wait = self.inner.lock.ttl();
        match self.inner.lock.acquire_within(job_id, wait, abort).await {
            Ok(Some(guard)) => Ok(guard),
            Ok(None) => Err(JobError::LockHeld(job_id)),
            Err(source) => Err(JobError::LockUnavailable { job_id, source }),
        }
    }

    /// Refresh the lock after a long wait. Fails if another holder took it.
    async fn confirm_lock(&self, guard: &LockGuard) -> JobResult<()> {
        let job_id = guard.job_id();
        match self.inner.lock.extend(guard).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(JobError::LockHeld(job_id)),
            Err(source) => Err(JobError::LockUnavailable { job_id, source }),
        }
    }

    pub(super) async fn report_activity(&self, job_id: JobId, text: &str) {
        if let Err(e) = self.inner.deps.progress.set_activity(job_id, text).await {
            debug!(job_id = %job_id, error = %e, "activity update skipped");
        }
    }
}

/// The later of the job's last update and its last checkpoint.
pub(super) fn last_activity(
    job: &ResearchJob,
    last_checkpoint: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    last_checkpoint.map_or(job.updated_at, |at| at.max(job.updated_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_activity_prefers_latest_timestamp() {
        let now = Utc::now();
        let mut job = ResearchJob::pending(SubjectId::new(), Duration::hours(1), now);
        job.updated_at = now - Duration::hours(3);

        assert_eq!(last_activity(&job, None), job.updated_at);
        assert_eq!(
            last_activity(&job, Some(now - Duration::minutes(5))),
            now - Duration::minutes(5)
        );
        assert_eq!(
            last_activity(&job, Some(now - Duration::hours(4))),
            job.updated_at
        );
    }
}
