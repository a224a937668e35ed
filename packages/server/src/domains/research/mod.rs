//! Research domain - long-running multi-phase research jobs with
//! checkpoint/resume, pause control and startup recovery

pub mod checkpoint_store;
pub mod context;
pub mod control;
pub mod error;
pub mod job_store;
pub mod models;
pub mod orchestrator;
pub mod phases;
pub mod recovery;
pub mod testing;
mod worker;

// Explicit re-exports to avoid ambiguous glob re-exports
pub use checkpoint_store::{
    CheckpointRepository, CheckpointStore, PostgresCheckpointRepository, ResumePoint,
};
pub use context::PhaseContext;
pub use control::{estimate_remaining, PauseOutcome, ProgressReport, ResumeOutcome, ResumedFrom};
pub use error::{JobError, JobResult};
pub use job_store::{JobStore, PostgresJobStore};
pub use models::{
    next_phase, Checkpoint, CheckpointPatch, FailureKind, JobStatus, Phase, ResearchJob,
    CHECKPOINT_VERSION, ENTITIES_COUNTER, PIPELINE,
};
pub use orchestrator::{JobOrchestrator, Transition};
pub use phases::{PhaseExecutor, PhaseOutcome, PhaseRegistry};
pub use recovery::RecoveryReport;
