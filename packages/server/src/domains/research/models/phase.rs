//! The fixed, linear research pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a job in the pipeline.
///
/// `Queued` and `Completed` bracket the four working phases; only the working
/// phases are ever dispatched to an executor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
    Default,
)]
#[sqlx(type_name = "research_phase", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    Queued,
    /// Discover and fetch pages.
    Crawl,
    /// Entity extraction over fetched pages.
    Extract,
    /// LLM synthesis sections.
    Analyze,
    /// Export documents.
    Generate,
    Completed,
}

/// The working phases, in execution order.
pub const PIPELINE: [Phase; 4] = [Phase::Crawl, Phase::Extract, Phase::Analyze, Phase::Generate];

impl Phase {
    /// First working phase of every run.
    pub fn first() -> Phase {
        PIPELINE[0]
    }

    /// Stable key used in checkpoints, cache entries and logs.
    pub fn key(&self) -> &'static str {
        match self {
            Phase::Queued => "queued",
            Phase::Crawl => "crawl",
            Phase::Extract => "extract",
            Phase::Analyze => "analyze",
            Phase::Generate => "generate",
            Phase::Completed => "completed",
        }
    }

    pub fn is_working(&self) -> bool {
        PIPELINE.contains(self)
    }
}

/// The phase that follows `current`, or `None` once the pipeline is done.
///
/// `Queued` advances to the first working phase; the last working phase
/// advances to `Completed`.
pub fn next_phase(current: Phase) -> Option<Phase> {
    match current {
        Phase::Queued => Some(Phase::Crawl),
        Phase::Crawl => Some(Phase::Extract),
        Phase::Extract => Some(Phase::Analyze),
        Phase::Analyze => Some(Phase::Generate),
        Phase::Generate => Some(Phase::Completed),
        Phase::Completed => None,
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_phase_walks_the_pipeline() {
        let mut seen = Vec::new();
        let mut current = Phase::Queued;
        while let Some(next) = next_phase(current) {
            seen.push(next);
            current = next;
        }

        assert_eq!(
            seen,
            vec![
                Phase::Crawl,
                Phase::Extract,
                Phase::Analyze,
                Phase::Generate,
                Phase::Completed
            ]
        );
    }

    #[test]
    fn test_only_pipeline_phases_are_working() {
        assert!(!Phase::Queued.is_working());
        assert!(!Phase::Completed.is_working());
        assert!(PIPELINE.iter().all(Phase::is_working));
        assert_eq!(Phase::first(), Phase::Crawl);
    }

    #[test]
    fn test_serde_uses_upper_case_names() {
        assert_eq!(serde_json::to_string(&Phase::Analyze).unwrap(), "\"ANALYZE\"");
    }
}
