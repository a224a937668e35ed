//! Typed errors for research job control.

use thiserror::Error;

use super::models::{JobStatus, Phase};
use crate::common::JobId;
use crate::kernel::CacheError;

/// Errors surfaced by the orchestrator and the control surface.
///
/// Lock-protected operations either complete fully or change nothing, so every
/// variant except `Storage` and `CorruptCheckpoint` means "nothing happened".
#[derive(Debug, Error)]
pub enum JobError {
    #[error("research job {0} not found")]
    NotFound(JobId),

    /// Operation attempted from the wrong status.
    #[error("research job {job_id} is {actual}; {operation} requires {expected}")]
    InvalidState {
        job_id: JobId,
        operation: &'static str,
        expected: &'static str,
        actual: JobStatus,
    },

    /// A phase transition that does not follow the pipeline order.
    #[error("research job {job_id} is in phase {current}; cannot move to {requested}")]
    UnexpectedPhase {
        job_id: JobId,
        current: Phase,
        requested: Phase,
    },

    /// Another operation holds the job lock.
    #[error("research job {0} is locked by another operation")]
    LockHeld(JobId),

    /// The lock store could not be reached; control operations fail closed.
    #[error("lock store unavailable for research job {job_id}: {source}")]
    LockUnavailable {
        job_id: JobId,
        #[source]
        source: CacheError,
    },

    /// The stored checkpoint is not a JSON object at all.
    #[error("checkpoint for research job {job_id} is unreadable: {reason}")]
    CorruptCheckpoint { job_id: JobId, reason: String },

    #[error("no executor registered for phase {0}")]
    NoExecutor(Phase),

    /// Durable store failure.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl JobError {
    /// Conflicts: wrong status or phase, or lock already held.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            JobError::InvalidState { .. }
                | JobError::UnexpectedPhase { .. }
                | JobError::LockHeld(_)
        )
    }

    /// Whether the caller may blindly retry: true when the operation was
    /// rejected before any state was touched.
    pub fn safe_to_retry(&self) -> bool {
        matches!(
            self,
            JobError::NotFound(_)
                | JobError::InvalidState { .. }
                | JobError::UnexpectedPhase { .. }
                | JobError::LockHeld(_)
                | JobError::LockUnavailable { .. }
        )
    }
}

pub type JobResult<T> = std::result::Result<T, JobError>;
