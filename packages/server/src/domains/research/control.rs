//! Control surface results and the progress read model.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::JobResult;
use super::models::{JobStatus, Phase};
use super::orchestrator::JobOrchestrator;
use crate::common::JobId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseOutcome {
    pub status: JobStatus,
    pub checkpoint_saved: bool,
    pub paused_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumedFrom {
    pub work_items_done_count: usize,
    pub entities_count: i64,
    pub phase: Phase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeOutcome {
    pub status: JobStatus,
    pub resumed_from: ResumedFrom,
}

/// Live view of a job for polling clients.
///
/// `percent_complete` is the current phase's progress. Durations are whole
/// seconds; `time_elapsed` excludes paused time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub phase: Phase,
    pub percent_complete: f64,
    pub counts: BTreeMap<String, i64>,
    pub time_elapsed: i64,
    pub estimated_time_remaining: Option<i64>,
    pub current_activity: Option<String>,
}

/// Linear extrapolation of the remaining time from the elapsed time and
/// percent done. `None` until at least one item is done and some progress
/// is measurable.
pub fn estimate_remaining(elapsed: Duration, percent: f64, items_done: i64) -> Option<Duration> {
    if items_done <= 0 || !percent.is_finite() || percent <= 0.0 {
        return None;
    }
    let percent = percent.min(100.0);
    let remaining_ms = elapsed.num_milliseconds() as f64 * (100.0 - percent) / percent;
    Some(Duration::milliseconds(remaining_ms.round() as i64))
}

impl JobOrchestrator {
    /// Merge the live cache snapshot (if reachable) with the durable
    /// checkpoint. Never fails because of the cache.
    pub async fn get_progress(&self, job_id: JobId) -> JobResult<ProgressReport> {
        let job = self.load_job(job_id).await?;
        let deps = self.deps();
        let now = self.now();

        let snapshot = deps
            .progress
            .get_progress(job_id)
            .await
            .unwrap_or_else(|e| {
                debug!(job_id = %job_id, error = %e, "progress cache unavailable");
                None
            })
            .filter(|snapshot| snapshot.phase == job.phase);
        let activity = deps.progress.get_activity(job_id).await.unwrap_or_else(|e| {
            debug!(job_id = %job_id, error = %e, "activity cache unavailable");
            None
        });
        let checkpoint = match deps.checkpoints.load(job_id).await {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "checkpoint unavailable for progress");
                None
            }
        };

        let percent_complete = if job.status == JobStatus::Completed {
            100.0
        } else {
            snapshot
                .as_ref()
                .map(|s| s.percent_complete)
                .or_else(|| checkpoint.as_ref().and_then(|c| c.phase_percent()))
                .unwrap_or(0.0)
        };

        let counts = match (&snapshot, &checkpoint) {
            (Some(snapshot), _) => snapshot.counts.clone(),
            (None, Some(checkpoint)) => checkpoint.progress_counts(),
            (None, None) => BTreeMap::new(),
        };
        let items_done = counts.get("work_items_done").copied().unwrap_or(0);

        let elapsed = job.active_elapsed(now);
        let estimated_time_remaining = if job.status.is_terminal() {
            None
        } else {
            estimate_remaining(elapsed, percent_complete, items_done).map(|d| d.num_seconds())
        };

        Ok(ProgressReport {
            job_id,
            status: job.status,
            phase: job.phase,
            percent_complete,
            counts,
            time_elapsed: elapsed.num_seconds(),
            estimated_time_remaining,
            current_activity: activity
                .or_else(|| snapshot.and_then(|s| s.current_activity)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_estimate_without_completed_items() {
        assert_eq!(estimate_remaining(Duration::seconds(300), 0.0, 0), None);
        assert_eq!(estimate_remaining(Duration::seconds(300), 40.0, 0), None);
    }

    #[test]
    fn test_no_estimate_from_zero_percent() {
        assert_eq!(estimate_remaining(Duration::seconds(300), 0.0, 3), None);
        assert_eq!(estimate_remaining(Duration::seconds(300), f64::NAN, 3), None);
    }

    #[test]
    fn test_half_done_estimates_equal_time_remaining() {
        assert_eq!(
            estimate_remaining(Duration::seconds(300), 50.0, 10),
            Some(Duration::seconds(300))
        );
    }

    #[test]
    fn test_finished_phase_estimates_nothing_left() {
        assert_eq!(
            estimate_remaining(Duration::seconds(300), 100.0, 20),
            Some(Duration::zero())
        );
    }
}
