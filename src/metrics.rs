//! Pipeline observability hooks.
//!
//! Metric transport is out of scope; the pipeline reports observations
//! through [`MetricsSink`] and ships with an in-memory implementation.
//! Sink methods are infallible so a misbehaving backend can never
//! propagate into the pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Terminal outcome label for pipeline-level observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
}

pub trait MetricsSink: Send + Sync {
    /// Active-pipeline gauge.
    fn pipeline_started(&self);
    fn pipeline_finished(&self);

    /// Terminal pipeline observation keyed by outcome.
    fn observe_pipeline(&self, outcome: RunOutcome, duration_ms: i64, cost: f64, tokens: u64);

    /// Per-stage observation.
    fn observe_stage(&self, stage: &str, completed: bool, duration_ms: i64, cost: f64, tokens: u64);

    fn cost_limit_exceeded(&self);
    fn runtime_limit_exceeded(&self);
}

/// Counter-based sink good enough for tests and the CLI status view.
#[derive(Default)]
pub struct InMemoryMetrics {
    active: AtomicI64,
    completed_runs: AtomicU64,
    failed_runs: AtomicU64,
    stage_completions: AtomicU64,
    stage_failures: AtomicU64,
    cost_limit_hits: AtomicU64,
    runtime_limit_hits: AtomicU64,
    total_tokens: AtomicU64,
    // Cost in micro-dollars so the sum can live in an atomic.
    total_cost_micros: AtomicU64,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_pipelines(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn completed_runs(&self) -> u64 {
        self.completed_runs.load(Ordering::SeqCst)
    }

    pub fn failed_runs(&self) -> u64 {
        self.failed_runs.load(Ordering::SeqCst)
    }

    pub fn stage_completions(&self) -> u64 {
        self.stage_completions.load(Ordering::SeqCst)
    }

    pub fn stage_failures(&self) -> u64 {
        self.stage_failures.load(Ordering::SeqCst)
    }

    pub fn cost_limit_hits(&self) -> u64 {
        self.cost_limit_hits.load(Ordering::SeqCst)
    }

    pub fn runtime_limit_hits(&self) -> u64 {
        self.runtime_limit_hits.load(Ordering::SeqCst)
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens.load(Ordering::SeqCst)
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost_micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }
}

impl MetricsSink for InMemoryMetrics {
    fn pipeline_started(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    fn pipeline_finished(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn observe_pipeline(&self, outcome: RunOutcome, _duration_ms: i64, cost: f64, tokens: u64) {
        match outcome {
            RunOutcome::Completed => self.completed_runs.fetch_add(1, Ordering::SeqCst),
            RunOutcome::Failed => self.failed_runs.fetch_add(1, Ordering::SeqCst),
        };
        self.total_tokens.fetch_add(tokens, Ordering::SeqCst);
        self.total_cost_micros
            .fetch_add((cost * 1_000_000.0) as u64, Ordering::SeqCst);
    }

    fn observe_stage(
        &self,
        _stage: &str,
        completed: bool,
        _duration_ms: i64,
        _cost: f64,
        _tokens: u64,
    ) {
        if completed {
            self.stage_completions.fetch_add(1, Ordering::SeqCst);
        } else {
            self.stage_failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn cost_limit_exceeded(&self) {
        self.cost_limit_hits.fetch_add(1, Ordering::SeqCst);
    }

    fn runtime_limit_exceeded(&self) {
        self.runtime_limit_hits.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scoped handle for the active-pipeline gauge: increments on creation
/// and decrements when dropped, so the gauge balances out on every
/// orchestrator exit path, including panics.
pub struct ActivePipelineGuard {
    metrics: Arc<dyn MetricsSink>,
}

impl ActivePipelineGuard {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        metrics.pipeline_started();
        Self { metrics }
    }
}

impl Drop for ActivePipelineGuard {
    fn drop(&mut self) {
        self.metrics.pipeline_finished();
    }
}
