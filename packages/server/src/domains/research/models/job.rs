//! Research job model and its lifecycle state machine.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use super::phase::Phase;
use crate::common::{JobId, SubjectId};
use crate::domains::research::error::{JobError, JobResult};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "research_job_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Paused => "PAUSED",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended up FAILED.
///
/// `Timeout` and `Stale` are graceful endings with partial results kept;
/// only `Error` means something actually broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "research_failure_kind", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Error,
    Timeout,
    Stale,
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ResearchJob {
    #[builder(default = JobId::new())]
    pub id: JobId,
    pub reference_id: SubjectId,

    #[builder(default)]
    pub status: JobStatus,
    #[builder(default)]
    pub phase: Phase,

    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub paused_at: Option<DateTime<Utc>>,
    /// Accumulated paused time, excluded from elapsed/timeout calculations.
    #[builder(default = 0)]
    pub total_paused_ms: i64,
    #[builder(default = 3600)]
    pub time_budget_secs: i64,

    #[builder(default, setter(strip_option))]
    pub failure_kind: Option<FailureKind>,
    #[builder(default, setter(strip_option))]
    pub failure_reason: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl ResearchJob {
    /// A fresh PENDING run for `reference_id`.
    pub fn pending(reference_id: SubjectId, time_budget: Duration, now: DateTime<Utc>) -> Self {
        Self::builder()
            .reference_id(reference_id)
            .time_budget_secs(time_budget.num_seconds())
            .created_at(now)
            .updated_at(now)
            .build()
    }

    /// A new PENDING run for the same subject and budget. History stays on `self`.
    pub fn rescan(&self, now: DateTime<Utc>) -> JobResult<Self> {
        if !self.status.is_terminal() {
            return Err(self.invalid("rescan", "COMPLETED or FAILED"));
        }
        Ok(Self::pending(self.reference_id, self.time_budget(), now))
    }

    pub fn total_paused(&self) -> Duration {
        Duration::milliseconds(self.total_paused_ms)
    }

    pub fn time_budget(&self) -> Duration {
        Duration::seconds(self.time_budget_secs)
    }

    pub fn require_status(
        &self,
        expected: JobStatus,
        operation: &'static str,
    ) -> JobResult<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(self.invalid(operation, expected.as_str()))
        }
    }

    fn invalid(&self, operation: &'static str, expected: &'static str) -> JobError {
        JobError::InvalidState {
            job_id: self.id,
            operation,
            expected,
            actual: self.status,
        }
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// PENDING → IN_PROGRESS at the first working phase.
    pub fn mark_started(&mut self, now: DateTime<Utc>) -> JobResult<()> {
        self.require_status(JobStatus::Pending, "start")?;
        self.status = JobStatus::InProgress;
        self.phase = Phase::first();
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn enter_phase(&mut self, phase: Phase, now: DateTime<Utc>) -> JobResult<()> {
        self.require_status(JobStatus::InProgress, "phase transition")?;
        self.phase = phase;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_paused(&mut self, now: DateTime<Utc>) -> JobResult<()> {
        self.require_status(JobStatus::InProgress, "pause")?;
        self.status = JobStatus::Paused;
        self.paused_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// PAUSED → IN_PROGRESS; returns how long this pause lasted.
    pub fn mark_resumed(&mut self, now: DateTime<Utc>) -> JobResult<Duration> {
        self.require_status(JobStatus::Paused, "resume")?;
        let paused_for = self.close_pause(now);
        self.status = JobStatus::InProgress;
        self.updated_at = now;
        Ok(paused_for)
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> JobResult<()> {
        self.require_status(JobStatus::InProgress, "complete")?;
        self.status = JobStatus::Completed;
        self.phase = Phase::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Any non-terminal status → FAILED with a tagged reason.
    pub fn mark_failed(
        &mut self,
        kind: FailureKind,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> JobResult<()> {
        if self.status.is_terminal() {
            return Err(self.invalid("fail", "a non-terminal status"));
        }
        self.close_pause(now);
        self.status = JobStatus::Failed;
        self.failure_kind = Some(kind);
        self.failure_reason = Some(reason.into());
        self.updated_at = now;
        Ok(())
    }

    /// Moves an open pause interval into `total_paused_ms`.
    fn close_pause(&mut self, now: DateTime<Utc>) -> Duration {
        let Some(paused_at) = self.paused_at.take() else {
            return Duration::zero();
        };
        let paused_for = (now - paused_at).max(Duration::zero());
        self.total_paused_ms += paused_for.num_milliseconds();
        paused_for
    }

    // ------------------------------------------------------------------------
    // Time accounting
    // ------------------------------------------------------------------------

    /// Wall time spent working, excluding every pause (including an open one).
    pub fn active_elapsed(&self, now: DateTime<Utc>) -> Duration {
        let Some(started_at) = self.started_at else {
            return Duration::zero();
        };
        let end = match self.status {
            JobStatus::Completed => self.completed_at.unwrap_or(now),
            JobStatus::Failed => self.updated_at,
            JobStatus::Paused => self.paused_at.unwrap_or(now),
            JobStatus::Pending | JobStatus::InProgress => now,
        };
        (end - started_at - self.total_paused()).max(Duration::zero())
    }

    pub fn budget_exceeded(&self, now: DateTime<Utc>) -> bool {
        self.started_at.is_some() && self.active_elapsed(now) > self.time_budget()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started_job(now: DateTime<Utc>) -> ResearchJob {
        let mut job = ResearchJob::pending(SubjectId::new(), Duration::seconds(600), now);
        job.mark_started(now).unwrap();
        job
    }

    #[test]
    fn test_start_requires_pending() {
        let now = Utc::now();
        let mut job = started_job(now);
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.phase, Phase::Crawl);

        let err = job.mark_started(now).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_paused_at_set_only_while_paused() {
        let t0 = Utc::now();
        let mut job = started_job(t0);
        assert!(job.paused_at.is_none());

        job.mark_paused(t0 + Duration::seconds(30)).unwrap();
        assert_eq!(job.status, JobStatus::Paused);
        assert!(job.paused_at.is_some());

        let paused_for = job.mark_resumed(t0 + Duration::seconds(330)).unwrap();
        assert_eq!(paused_for, Duration::seconds(300));
        assert!(job.paused_at.is_none());
        assert_eq!(job.total_paused(), Duration::seconds(300));
    }

    #[test]
    fn test_active_elapsed_excludes_pauses() {
        let t0 = Utc::now();
        let mut job = started_job(t0);
        job.mark_paused(t0 + Duration::seconds(30)).unwrap();

        // Open pause does not count either.
        assert_eq!(job.active_elapsed(t0 + Duration::seconds(200)), Duration::seconds(30));

        job.mark_resumed(t0 + Duration::seconds(330)).unwrap();
        assert_eq!(job.active_elapsed(t0 + Duration::seconds(340)), Duration::seconds(40));
    }

    #[test]
    fn test_completed_phase_matches_completed_status() {
        let now = Utc::now();
        let mut job = started_job(now);
        job.mark_completed(now).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.phase, Phase::Completed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_fail_from_paused_closes_pause() {
        let t0 = Utc::now();
        let mut job = started_job(t0);
        job.mark_paused(t0).unwrap();
        job.mark_failed(FailureKind::Error, "boom", t0 + Duration::seconds(5))
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.paused_at.is_none());
        assert_eq!(job.failure_kind, Some(FailureKind::Error));
        assert!(job.mark_failed(FailureKind::Error, "again", t0).is_err());
    }

    #[test]
    fn test_budget_exceeded_ignores_paused_time() {
        let t0 = Utc::now();
        let mut job = started_job(t0);
        job.mark_paused(t0 + Duration::seconds(500)).unwrap();
        job.mark_resumed(t0 + Duration::seconds(5000)).unwrap();

        assert!(!job.budget_exceeded(t0 + Duration::seconds(5050)));
        assert!(job.budget_exceeded(t0 + Duration::seconds(5101)));
    }

    #[test]
    fn test_rescan_only_from_terminal() {
        let now = Utc::now();
        let mut job = started_job(now);
        assert!(job.rescan(now).is_err());

        job.mark_failed(FailureKind::Timeout, "budget", now).unwrap();
        let fresh = job.rescan(now).unwrap();
        assert_ne!(fresh.id, job.id);
        assert_eq!(fresh.reference_id, job.reference_id);
        assert_eq!(fresh.status, JobStatus::Pending);
        assert_eq!(fresh.phase, Phase::Queued);
    }
}
