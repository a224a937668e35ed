//! Typed ID definitions for the research job entities.

pub use super::id::Id;

/// Marker type for research job runs.
pub struct JobRun;

/// Marker type for the subject being researched (e.g. an organization).
pub struct Subject;

/// Typed ID for research job runs.
pub type JobId = Id<JobRun>;

/// Typed ID for research subjects. A rescan creates a new `JobId` for the same
/// `SubjectId`.
pub type SubjectId = Id<Subject>;
