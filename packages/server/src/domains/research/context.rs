//! What a phase executor sees while it runs.
//!
//! The context owns nothing durable itself. It edits the worker's shared
//! working checkpoint, publishes live progress (best effort), persists the
//! checkpoint on the configured item/time cadence, and tells the executor when
//! to stop.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::error::{JobError, JobResult};
use super::models::{Checkpoint, CheckpointPatch, JobStatus, Phase};
use super::worker::{lock_state, Budget, CheckpointPolicy, StopReason, WorkerControl, WorkerHandle};
use crate::common::JobId;
use crate::kernel::{JobDeps, ProgressSnapshot};

pub struct PhaseContext {
    job_id: JobId,
    phase: Phase,
    state: Arc<Mutex<Checkpoint>>,
    control: Arc<WorkerControl>,
    budget: Budget,
    policy: CheckpointPolicy,
    deps: JobDeps,
    activity: Option<String>,
    items_since_checkpoint: u32,
    last_checkpoint_at: DateTime<Utc>,
}

impl PhaseContext {
    pub(crate) fn new(
        job_id: JobId,
        phase: Phase,
        handle: &WorkerHandle,
        budget: Budget,
        deps: JobDeps,
    ) -> Self {
        let now = deps.clock.now();
        Self {
            job_id,
            phase,
            state: handle.state.clone(),
            control: handle.control.clone(),
            budget,
            policy: CheckpointPolicy::from_settings(&deps.settings),
            deps,
            activity: None,
            items_since_checkpoint: 0,
            last_checkpoint_at: now,
        }
    }

    // ------------------------------------------------------------------------
    // Work items
    // ------------------------------------------------------------------------

    pub fn next_item(&self) -> Option<String> {
        lock_state(&self.state).next_queued().map(str::to_string)
    }

    /// Queue an item for this phase. Done or already queued items are ignored.
    pub fn enqueue(&self, item: impl Into<String>) -> bool {
        lock_state(&self.state).enqueue(item)
    }

    pub fn discover_secondary(&self, item: impl Into<String>) -> bool {
        lock_state(&self.state)
            .secondary_discovered_items
            .insert(item.into())
    }

    pub fn record_depth(&self, depth: i64) {
        let mut state = lock_state(&self.state);
        state.depth_reached = state.depth_reached.max(depth);
    }

    /// Mark `item` processed. Publishes progress and persists the checkpoint
    /// when the item or time interval is due.
    ///
    /// A failed periodic save is logged and retried at the next interval.
    pub async fn complete_item(&mut self, item: &str) {
        let newly_done = lock_state(&self.state).complete_item(item);
        if !newly_done {
            return;
        }
        self.items_since_checkpoint += 1;
        self.publish_progress(None).await;

        let since_last = self.deps.clock.now() - self.last_checkpoint_at;
        if self.policy.is_due(self.items_since_checkpoint, since_last) {
            if let Err(e) = self.save_checkpoint().await {
                warn!(
                    job_id = %self.job_id,
                    phase = %self.phase,
                    error = %e,
                    "periodic checkpoint failed"
                );
            }
        }
    }

    // ------------------------------------------------------------------------
    // Counters and sub-steps
    // ------------------------------------------------------------------------

    pub fn increment(&self, counter: &str, by: i64) {
        lock_state(&self.state).increment(counter, by);
    }

    pub fn is_step_complete(&self, step: &str) -> bool {
        lock_state(&self.state).is_step_complete(self.phase, step)
    }

    /// Record a finished sub-step and persist it right away, so a restart
    /// never repeats it.
    pub async fn complete_step(&mut self, step: &str) -> JobResult<()> {
        let newly_done = lock_state(&self.state).complete_step(self.phase, step);
        if newly_done {
            self.save_checkpoint().await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Progress (best effort)
    // ------------------------------------------------------------------------

    pub async fn set_activity(&mut self, text: impl Into<String>) {
        let text = text.into();
        if let Err(e) = self.deps.progress.set_activity(self.job_id, &text).await {
            debug!(job_id = %self.job_id, error = %e, "activity update skipped");
        }
        self.activity = Some(text);
    }

    /// Publish progress with an explicit percentage, for phases whose work is
    /// not a list of items.
    pub async fn report_progress(&mut self, percent: f64) {
        self.publish_progress(Some(percent)).await;
    }

    async fn publish_progress(&self, percent: Option<f64>) {
        let snapshot = {
            let state = lock_state(&self.state);
            ProgressSnapshot {
                phase: self.phase,
                percent_complete: percent
                    .or_else(|| state.phase_percent())
                    .unwrap_or(0.0)
                    .clamp(0.0, 100.0),
                current_activity: self.activity.clone(),
                counts: state.progress_counts(),
                updated_at: self.deps.clock.now(),
            }
        };

        if let Err(e) = self.deps.progress.set_progress(self.job_id, &snapshot).await {
            debug!(job_id = %self.job_id, error = %e, "progress update skipped");
        }
    }

    // ------------------------------------------------------------------------
    // Stopping
    // ------------------------------------------------------------------------

    /// True when the executor should return `Interrupted` after its current
    /// unit of work: a pause or stop was requested, or the job ran out of time.
    pub fn should_stop(&self) -> bool {
        if self.control.is_stop_requested() {
            return true;
        }
        if self.budget.exceeded(self.deps.clock.now()) {
            debug!(job_id = %self.job_id, "time budget exhausted, stopping worker");
            self.control.request(StopReason::BudgetExceeded);
            return true;
        }
        false
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        self.control.token().cancelled().await;
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Persist the working checkpoint now.
    ///
    /// Skipped (returning false) once a stop was requested or the job left
    /// IN_PROGRESS; whoever stopped the worker persists its state instead.
    pub async fn save_checkpoint(&mut self) -> JobResult<bool> {
        if self.control.is_stop_requested() {
            return Ok(false);
        }
        let job = self
            .deps
            .jobs
            .find(self.job_id)
            .await?
            .ok_or(JobError::NotFound(self.job_id))?;
        if job.status != JobStatus::InProgress {
            debug!(job_id = %self.job_id, status = %job.status, "job no longer running, checkpoint skipped");
            return Ok(false);
        }

        let patch = CheckpointPatch::from(&*lock_state(&self.state));
        self.deps.checkpoints.save(self.job_id, patch).await?;
        self.items_since_checkpoint = 0;
        self.last_checkpoint_at = self.deps.clock.now();
        Ok(true)
    }
}
