//! Phase executors for tests.
//!
//! `ItemExecutor` behaves like a crawl: it works through a queue of items
//! and, when gated, processes one item per released permit so tests can stop
//! a job at an exact position. `StepExecutor` behaves like a synthesis phase
//! made of named sub-steps.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::context::PhaseContext;
use super::models::{Phase, ENTITIES_COUNTER};
use super::phases::{PhaseExecutor, PhaseOutcome, PhaseRegistry};

pub struct ItemExecutor {
    items: Vec<String>,
    gate: Option<Arc<Semaphore>>,
    entities_per_item: i64,
    fail_on: Option<String>,
    processed: Mutex<Vec<String>>,
}

impl ItemExecutor {
    /// Processes `items` without waiting.
    pub fn new<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            items: items.into_iter().map(Into::into).collect(),
            gate: None,
            entities_per_item: 1,
            fail_on: None,
            processed: Mutex::new(Vec::new()),
        }
    }

    /// `count` items named `https://example.org/page/{n}` for n in 1..=count.
    pub fn pages(count: usize) -> Self {
        Self::new((1..=count).map(|n| format!("https://example.org/page/{}", n)))
    }

    /// Process an item only when a permit is released with `release`.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Return an error instead of processing `item`.
    pub fn failing_on(mut self, item: impl Into<String>) -> Self {
        self.fail_on = Some(item.into());
        self
    }

    pub fn release(&self, items: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(items);
        }
    }

    /// Every item processed so far, across runs, in order.
    pub fn processed(&self) -> Vec<String> {
        self.processed.lock().unwrap().clone()
    }

    /// Wait (up to five seconds) until `count` items have been processed.
    pub async fn wait_for_processed(&self, count: usize) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if self.processed.lock().unwrap().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

#[async_trait]
impl PhaseExecutor for ItemExecutor {
    async fn execute(&self, ctx: &mut PhaseContext) -> anyhow::Result<PhaseOutcome> {
        for item in &self.items {
            ctx.enqueue(item.clone());
        }

        loop {
            if ctx.should_stop() {
                return Ok(PhaseOutcome::Interrupted);
            }
            let Some(item) = ctx.next_item() else {
                return Ok(PhaseOutcome::Completed);
            };

            if let Some(gate) = &self.gate {
                tokio::select! {
                    permit = gate.acquire() => permit?.forget(),
                    _ = ctx.stopped() => return Ok(PhaseOutcome::Interrupted),
                }
            }
            if self.fail_on.as_deref() == Some(item.as_str()) {
                bail!("fetch failed for {}", item);
            }

            ctx.set_activity(format!("Fetching {}", item)).await;
            ctx.increment(ENTITIES_COUNTER, self.entities_per_item);
            ctx.complete_item(&item).await;
            self.processed.lock().unwrap().push(item);
        }
    }
}

pub struct StepExecutor {
    steps: Vec<String>,
    runs: Mutex<Vec<String>>,
}

impl StepExecutor {
    pub fn new<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            steps: steps.into_iter().map(Into::into).collect(),
            runs: Mutex::new(Vec::new()),
        }
    }

    /// Every sub-step executed so far, across runs.
    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl PhaseExecutor for StepExecutor {
    async fn execute(&self, ctx: &mut PhaseContext) -> anyhow::Result<PhaseOutcome> {
        let total = self.steps.len().max(1) as f64;
        for (index, step) in self.steps.iter().enumerate() {
            if ctx.is_step_complete(step) {
                continue;
            }
            if ctx.should_stop() {
                return Ok(PhaseOutcome::Interrupted);
            }
            self.runs.lock().unwrap().push(step.clone());
            ctx.complete_step(step).await?;
            ctx.report_progress((index + 1) as f64 * 100.0 / total).await;
        }
        Ok(PhaseOutcome::Completed)
    }
}

/// Full pipeline with `crawl` as the first phase and quick sub-step
/// executors for the rest.
pub fn pipeline(crawl: Arc<dyn PhaseExecutor>) -> PhaseRegistry {
    PhaseRegistry::new()
        .with(Phase::Crawl, crawl)
        .with(Phase::Extract, Arc::new(StepExecutor::new(["entities"])))
        .with(Phase::Analyze, Arc::new(StepExecutor::new(["summary", "themes"])))
        .with(Phase::Generate, Arc::new(StepExecutor::new(["document"])))
}
