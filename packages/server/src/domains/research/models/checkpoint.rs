//! Durable, resumable state of a research job.
//!
//! A checkpoint is stored as a JSON object. Reading is deliberately lenient:
//! each field is decoded on its own and falls back to its default when it is
//! missing or has the wrong type, and version 1 records (crawl-specific key
//! names) are migrated in place. Only a value that is not an object at all is
//! rejected.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use super::phase::{Phase, PIPELINE};

/// Schema version written by this build.
pub const CHECKPOINT_VERSION: i32 = 2;

/// Counter incremented by the extract phase for every entity it stores.
pub const ENTITIES_COUNTER: &str = "entities";

/// Version 1 key → version 2 key.
const V1_RENAMES: [(&str, &str); 4] = [
    ("visited_urls", "work_items_done"),
    ("queued_urls", "work_items_queued"),
    ("external_links", "secondary_discovered_items"),
    ("max_depth", "depth_reached"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_version: i32,
    /// Items already processed in the current phase; never reprocessed.
    pub work_items_done: IndexSet<String>,
    /// Items waiting to be processed in the current phase, in order.
    pub work_items_queued: IndexSet<String>,
    /// Items found but not queued (e.g. off-domain links).
    pub secondary_discovered_items: IndexSet<String>,
    pub depth_reached: i64,
    pub phase_start_time: Option<DateTime<Utc>>,
    pub last_checkpoint_time: Option<DateTime<Utc>>,
    pub sub_step_counts: BTreeMap<String, i64>,
    /// Finished phases (`"crawl"`) and finished sub-steps (`"analyze/summary"`).
    pub completed_sub_phases: IndexSet<String>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            checkpoint_version: CHECKPOINT_VERSION,
            work_items_done: IndexSet::new(),
            work_items_queued: IndexSet::new(),
            secondary_discovered_items: IndexSet::new(),
            depth_reached: 0,
            phase_start_time: None,
            last_checkpoint_time: None,
            sub_step_counts: BTreeMap::new(),
            completed_sub_phases: IndexSet::new(),
        }
    }
}

impl Checkpoint {
    // ------------------------------------------------------------------------
    // Encoding
    // ------------------------------------------------------------------------

    /// Decode a stored record, filling defaults field by field.
    ///
    /// Returns `Err` with a description only when `value` is not a JSON object.
    pub fn decode(value: &Value) -> Result<Self, String> {
        let Value::Object(stored) = value else {
            return Err(format!("expected a JSON object, found {}", json_kind(value)));
        };

        let mut fields = stored.clone();
        let version = fields
            .get("checkpoint_version")
            .and_then(Value::as_i64)
            .unwrap_or(1);

        if version < 2 {
            migrate_v1(&mut fields);
        } else if version > i64::from(CHECKPOINT_VERSION) {
            warn!(
                version,
                supported = CHECKPOINT_VERSION,
                "checkpoint written by a newer schema, reading known fields only"
            );
        }

        let mut checkpoint = Self {
            checkpoint_version: CHECKPOINT_VERSION,
            work_items_done: field(&fields, "work_items_done"),
            work_items_queued: field(&fields, "work_items_queued"),
            secondary_discovered_items: field(&fields, "secondary_discovered_items"),
            depth_reached: field(&fields, "depth_reached"),
            phase_start_time: field(&fields, "phase_start_time"),
            last_checkpoint_time: field(&fields, "last_checkpoint_time"),
            sub_step_counts: field(&fields, "sub_step_counts"),
            completed_sub_phases: field(&fields, "completed_sub_phases"),
        };
        checkpoint.normalize();
        Ok(checkpoint)
    }

    pub fn encode(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// Enforce `done ∩ queued = ∅`; done wins.
    pub fn normalize(&mut self) {
        let done = &self.work_items_done;
        self.work_items_queued.retain(|item| !done.contains(item));
    }

    // ------------------------------------------------------------------------
    // Work items
    // ------------------------------------------------------------------------

    pub fn is_done(&self, item: &str) -> bool {
        self.work_items_done.contains(item)
    }

    /// Queue an item unless it is already done or queued.
    pub fn enqueue(&mut self, item: impl Into<String>) -> bool {
        let item = item.into();
        if self.work_items_done.contains(&item) {
            return false;
        }
        self.work_items_queued.insert(item)
    }

    /// Next item to process: the oldest queued one.
    pub fn next_queued(&self) -> Option<&str> {
        self.work_items_queued.first().map(String::as_str)
    }

    /// Move an item to the done set. Returns false if it was already done.
    pub fn complete_item(&mut self, item: &str) -> bool {
        self.work_items_queued.shift_remove(item);
        self.work_items_done.insert(item.to_string())
    }

    // ------------------------------------------------------------------------
    // Counters and sub-steps
    // ------------------------------------------------------------------------

    pub fn increment(&mut self, counter: &str, by: i64) {
        *self.sub_step_counts.entry(counter.to_string()).or_insert(0) += by;
    }

    pub fn count(&self, counter: &str) -> i64 {
        self.sub_step_counts.get(counter).copied().unwrap_or(0)
    }

    pub fn step_key(phase: Phase, step: &str) -> String {
        format!("{}/{}", phase.key(), step)
    }

    pub fn is_step_complete(&self, phase: Phase, step: &str) -> bool {
        self.completed_sub_phases
            .contains(&Self::step_key(phase, step))
    }

    pub fn complete_step(&mut self, phase: Phase, step: &str) -> bool {
        self.completed_sub_phases.insert(Self::step_key(phase, step))
    }

    // ------------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------------

    pub fn is_phase_complete(&self, phase: Phase) -> bool {
        self.completed_sub_phases.contains(phase.key())
    }

    pub fn begin_phase(&mut self, now: DateTime<Utc>) {
        if self.phase_start_time.is_none() {
            self.phase_start_time = Some(now);
        }
    }

    /// Record `phase` as finished and drop its phase-scoped work state.
    ///
    /// The number of items the phase processed survives as the
    /// `"<phase>_items"` counter.
    pub fn finish_phase(&mut self, phase: Phase) {
        let processed = self.work_items_done.len() as i64;
        if processed > 0 {
            self.sub_step_counts
                .insert(format!("{}_items", phase.key()), processed);
        }
        self.completed_sub_phases.insert(phase.key().to_string());
        self.work_items_done.clear();
        self.work_items_queued.clear();
        self.secondary_discovered_items.clear();
        self.phase_start_time = None;
    }

    /// Where execution continues: the first pipeline phase not yet finished.
    ///
    /// Queued work items always belong to that phase, because finishing a
    /// phase clears the queue.
    pub fn resume_phase(&self) -> Phase {
        PIPELINE
            .into_iter()
            .find(|phase| !self.is_phase_complete(*phase))
            .unwrap_or(Phase::Completed)
    }

    /// A checkpoint with no finished sub-step and an empty queue is the same
    /// as starting fresh.
    pub fn is_resumable(&self) -> bool {
        !self.completed_sub_phases.is_empty() || !self.work_items_queued.is_empty()
    }

    /// Flat counters for progress display: set sizes, depth, and every
    /// sub-step counter.
    pub fn progress_counts(&self) -> BTreeMap<String, i64> {
        let mut counts = self.sub_step_counts.clone();
        counts.insert("work_items_done".into(), self.work_items_done.len() as i64);
        counts.insert("work_items_queued".into(), self.work_items_queued.len() as i64);
        counts.insert(
            "secondary_discovered_items".into(),
            self.secondary_discovered_items.len() as i64,
        );
        counts.insert("depth_reached".into(), self.depth_reached);
        counts
    }

    /// Percent of the current phase's known items that are done, if any are known.
    pub fn phase_percent(&self) -> Option<f64> {
        let done = self.work_items_done.len();
        let total = done + self.work_items_queued.len();
        if total == 0 {
            return None;
        }
        Some(done as f64 * 100.0 / total as f64)
    }
}

fn field<T: DeserializeOwned + Default>(fields: &Map<String, Value>, key: &str) -> T {
    match fields.get(key) {
        None | Some(Value::Null) => T::default(),
        Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
            warn!(field = key, error = %e, "checkpoint field unreadable, using default");
            T::default()
        }),
    }
}

fn migrate_v1(fields: &mut Map<String, Value>) {
    for (old, new) in V1_RENAMES {
        if let Some(value) = fields.remove(old) {
            fields.entry(new.to_string()).or_insert(value);
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ============================================================================
// Patches
// ============================================================================

/// Partial update merged into a stored checkpoint by `CheckpointStore::save`.
///
/// `None` leaves the stored field untouched; counters merge per key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointPatch {
    pub work_items_done: Option<IndexSet<String>>,
    pub work_items_queued: Option<IndexSet<String>>,
    pub secondary_discovered_items: Option<IndexSet<String>>,
    pub depth_reached: Option<i64>,
    pub phase_start_time: Option<Option<DateTime<Utc>>>,
    pub sub_step_counts: Option<BTreeMap<String, i64>>,
    pub completed_sub_phases: Option<IndexSet<String>>,
}

impl CheckpointPatch {
    pub fn apply(self, target: &mut Checkpoint) {
        if let Some(done) = self.work_items_done {
            target.work_items_done = done;
        }
        if let Some(queued) = self.work_items_queued {
            target.work_items_queued = queued;
        }
        if let Some(secondary) = self.secondary_discovered_items {
            target.secondary_discovered_items = secondary;
        }
        if let Some(depth) = self.depth_reached {
            target.depth_reached = depth;
        }
        if let Some(start) = self.phase_start_time {
            target.phase_start_time = start;
        }
        if let Some(counts) = self.sub_step_counts {
            target.sub_step_counts.extend(counts);
        }
        if let Some(completed) = self.completed_sub_phases {
            target.completed_sub_phases = completed;
        }
        target.checkpoint_version = CHECKPOINT_VERSION;
        target.normalize();
    }
}

impl From<&Checkpoint> for CheckpointPatch {
    /// A patch that replaces every field with the given state.
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            work_items_done: Some(checkpoint.work_items_done.clone()),
            work_items_queued: Some(checkpoint.work_items_queued.clone()),
            secondary_discovered_items: Some(checkpoint.secondary_discovered_items.clone()),
            depth_reached: Some(checkpoint.depth_reached),
            phase_start_time: Some(checkpoint.phase_start_time),
            sub_step_counts: Some(checkpoint.sub_step_counts.clone()),
            completed_sub_phases: Some(checkpoint.completed_sub_phases.clone()),
        }
    }
}
