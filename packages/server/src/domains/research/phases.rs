//! Phase execution contract.
//!
//! The work done inside each phase (crawling, entity extraction, LLM
//! synthesis, document rendering) lives outside this subsystem. Each phase
//! plugs in a `PhaseExecutor`, and the orchestrator drives the executors in
//! pipeline order through a `PhaseContext`.
//!
//! An executor must:
//! - skip work items the context reports as done and sub-steps it reports as
//!   complete (re-entering either must not duplicate side effects)
//! - call `PhaseContext::complete_item` / `complete_step` as work finishes, which
//!   also drives the periodic checkpoint
//! - poll `PhaseContext::should_stop` between units of work and return
//!   `PhaseOutcome::Interrupted` when it is true
//! - return `PhaseOutcome::Completed` once the phase has nothing left to do
//!
//! Returning `Err` fails the job with its progress preserved.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::context::PhaseContext;
use super::models::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// The phase finished all its work.
    Completed,
    /// The executor stopped early because `should_stop` returned true.
    Interrupted,
}

#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(&self, ctx: &mut PhaseContext) -> anyhow::Result<PhaseOutcome>;
}

/// Maps each working phase to its executor.
#[derive(Clone, Default)]
pub struct PhaseRegistry {
    executors: HashMap<Phase, Arc<dyn PhaseExecutor>>,
}

impl PhaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` for `phase`. Non-working phases are ignored.
    pub fn with(mut self, phase: Phase, executor: Arc<dyn PhaseExecutor>) -> Self {
        if phase.is_working() {
            self.executors.insert(phase, executor);
        } else {
            warn!(phase = %phase, "ignoring executor for a non-working phase");
        }
        self
    }

    pub fn get(&self, phase: Phase) -> Option<Arc<dyn PhaseExecutor>> {
        self.executors.get(&phase).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
