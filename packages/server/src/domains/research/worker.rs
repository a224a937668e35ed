//! In-process bookkeeping for running phase workers.
//!
//! Each IN_PROGRESS job has at most one worker task in this process. The task
//! shares its working checkpoint with the orchestrator through `WorkerHandle`
//! so pause and timeout can persist exactly what the worker has done, and it
//! signals `finished` when it exits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::models::{Checkpoint, ResearchJob};
use crate::common::{to_chrono, JobId};
use crate::config::JobSettings;

/// Why a worker was asked to stop. The first request wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    Pause,
    Timeout,
    Failed,
    /// The job was completed or moved on by an explicit call.
    Superseded,
    /// The worker noticed on its own that the job ran out of time.
    BudgetExceeded,
}

#[derive(Debug, Default)]
pub(crate) struct WorkerControl {
    token: CancellationToken,
    reason: Mutex<Option<StopReason>>,
}

impl WorkerControl {
    pub fn request(&self, reason: StopReason) {
        {
            let mut current = lock(&self.reason);
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<StopReason> {
        *lock(&self.reason)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[derive(Clone)]
pub(crate) struct WorkerHandle {
    pub run_id: Uuid,
    pub control: Arc<WorkerControl>,
    pub state: Arc<Mutex<Checkpoint>>,
    finished: watch::Receiver<bool>,
}

impl WorkerHandle {
    pub fn snapshot(&self) -> Checkpoint {
        lock(&self.state).clone()
    }

    fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Resolves once the worker task has exited.
    pub async fn exited(&self) {
        let mut finished = self.finished.clone();
        loop {
            if *finished.borrow_and_update() {
                return;
            }
            // Sender dropped means the task is gone.
            if finished.changed().await.is_err() {
                return;
            }
        }
    }

    async fn wait_finished(&self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.exited()).await.is_ok()
    }
}

/// What a stopped worker left behind.
pub(crate) struct StoppedWorker {
    pub state: Checkpoint,
    /// False if the worker was still mid-unit when the wait ran out.
    pub exited: bool,
}

/// A freshly registered worker.
pub(crate) struct Registered {
    pub handle: WorkerHandle,
    pub finished: watch::Sender<bool>,
    /// The stopping worker this one replaced, if it has not exited yet. The
    /// new worker must not run until it has.
    pub previous: Option<WorkerHandle>,
}

/// Jobs with a live worker task in this process.
#[derive(Clone, Default)]
pub(crate) struct ActiveWorkers {
    workers: Arc<Mutex<HashMap<JobId, WorkerHandle>>>,
}

impl ActiveWorkers {
    /// Register a new worker for `job_id` seeded with `state`.
    ///
    /// Refused while another worker for the job is running and has not been
    /// asked to stop. A stopping worker is replaced but handed back in
    /// `previous` until it exits; it never writes again.
    pub fn register(&self, job_id: JobId, state: Checkpoint) -> Option<Registered> {
        let mut workers = lock(&self.workers);
        let previous = match workers.get(&job_id) {
            Some(existing) if !existing.is_finished() => {
                if !existing.control.is_stop_requested() {
                    return None;
                }
                Some(existing.clone())
            }
            _ => None,
        };

        let (finished_tx, finished_rx) = watch::channel(false);
        let handle = WorkerHandle {
            run_id: Uuid::new_v4(),
            control: Arc::new(WorkerControl::default()),
            state: Arc::new(Mutex::new(state)),
            finished: finished_rx,
        };
        workers.insert(job_id, handle.clone());
        Some(Registered {
            handle,
            finished: finished_tx,
            previous,
        })
    }

    pub fn get(&self, job_id: JobId) -> Option<WorkerHandle> {
        lock(&self.workers).get(&job_id).cloned()
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.get(job_id)
            .is_some_and(|handle| !handle.is_finished() && !handle.control.is_stop_requested())
    }

    /// Drop the entry for `job_id` if it still belongs to `run_id`.
    pub fn remove(&self, job_id: JobId, run_id: Uuid) {
        let mut workers = lock(&self.workers);
        if workers.get(&job_id).is_some_and(|h| h.run_id == run_id) {
            workers.remove(&job_id);
        }
    }

    /// Ask the job's worker to stop and wait up to `wait` for it to exit.
    ///
    /// Returns the worker's working checkpoint, or `None` if no worker runs
    /// here.
    pub async fn stop(
        &self,
        job_id: JobId,
        reason: StopReason,
        wait: Duration,
    ) -> Option<StoppedWorker> {
        let handle = self.get(job_id)?;
        handle.control.request(reason);
        let exited = handle.wait_finished(wait).await;
        if !exited {
            debug!(job_id = %job_id, "worker still busy after stop wait");
        }
        Some(StoppedWorker {
            state: handle.snapshot(),
            exited,
        })
    }

    /// Request a stop without waiting.
    pub fn signal(&self, job_id: JobId, reason: StopReason) {
        if let Some(handle) = self.get(job_id) {
            handle.control.request(reason);
        }
    }
}

/// The job-level time budget as seen by a worker.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Budget {
    started_at: Option<DateTime<Utc>>,
    total_paused: chrono::Duration,
    limit: chrono::Duration,
}

impl Budget {
    pub fn for_job(job: &ResearchJob) -> Self {
        Self {
            started_at: job.started_at,
            total_paused: job.total_paused(),
            limit: job.time_budget(),
        }
    }

    pub fn exceeded(&self, now: DateTime<Utc>) -> bool {
        self.started_at
            .is_some_and(|started| now - started - self.total_paused > self.limit)
    }
}

/// When a running phase persists its working checkpoint.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CheckpointPolicy {
    item_interval: u32,
    time_interval: chrono::Duration,
}

impl CheckpointPolicy {
    pub fn from_settings(settings: &JobSettings) -> Self {
        Self {
            item_interval: settings.checkpoint_item_interval,
            time_interval: to_chrono(settings.checkpoint_time_interval),
        }
    }

    /// Due after `item_interval` new items or `time_interval` since the last
    /// save, whichever comes first. Nothing new means nothing to save.
    pub fn is_due(&self, items_since: u32, since_last: chrono::Duration) -> bool {
        if items_since == 0 {
            return false;
        }
        (self.item_interval > 0 && items_since >= self.item_interval)
            || since_last >= self.time_interval
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn lock_state(state: &Mutex<Checkpoint>) -> MutexGuard<'_, Checkpoint> {
    lock(state)
}
