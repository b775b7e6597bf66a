//! Drives one MVP through the full stage sequence.

use std::sync::Arc;

use console::Style;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::metrics::{ActivePipelineGuard, MetricsSink, RunOutcome};
use crate::pipeline::executor::StageExecutor;
use crate::runtime::StageRuntime;
use crate::state_machine::MvpState;
use crate::store::MvpStore;

/// One entry in the fixed stage sequence.
pub struct StageSpec {
    pub name: &'static str,
    pub target: MvpState,
    pub failure_state: Option<MvpState>,
}

/// The fixed pipeline sequence, executed strictly in order.
pub const STAGES: &[StageSpec] = &[
    StageSpec {
        name: "ideation",
        target: MvpState::Ideating,
        failure_state: None,
    },
    StageSpec {
        name: "architecture",
        target: MvpState::Architecting,
        failure_state: None,
    },
    StageSpec {
        name: "building",
        target: MvpState::Building,
        failure_state: Some(MvpState::BuildFailed),
    },
    StageSpec {
        name: "deployment",
        target: MvpState::Deploying,
        failure_state: Some(MvpState::DeployFailed),
    },
    StageSpec {
        name: "tokenization",
        target: MvpState::Tokenizing,
        failure_state: None,
    },
];

/// Index of the first stage to execute for a persisted status. Crash
/// recovery replays no partial stage state: it re-executes the stage
/// the status implies.
fn resume_index(status: MvpState) -> Option<usize> {
    match status {
        MvpState::Created | MvpState::Ideating => Some(0),
        MvpState::Architecting => Some(1),
        MvpState::Building | MvpState::BuildFailed => Some(2),
        MvpState::Deploying | MvpState::DeployFailed => Some(3),
        MvpState::Tokenizing => Some(4),
        MvpState::Completed | MvpState::Failed => None,
    }
}

pub struct PipelineOrchestrator<R: StageRuntime> {
    store: Arc<MvpStore>,
    executor: StageExecutor<R>,
    metrics: Arc<dyn MetricsSink>,
    max_agent_retries: u32,
}

impl<R: StageRuntime> PipelineOrchestrator<R> {
    pub fn new(
        store: Arc<MvpStore>,
        executor: StageExecutor<R>,
        metrics: Arc<dyn MetricsSink>,
        max_agent_retries: u32,
    ) -> Self {
        Self {
            store,
            executor,
            metrics,
            max_agent_retries,
        }
    }

    pub fn store(&self) -> &Arc<MvpStore> {
        &self.store
    }

    /// Execute the stage sequence for one MVP.
    ///
    /// Assumes a single logical owner per MVP id; the admission
    /// conflict guard must have run before this is invoked. A run ends
    /// in COMPLETED, in FAILED (guardrail violation or retry ceiling),
    /// or parked in its last non-terminal state awaiting recovery;
    /// there is no automatic in-process re-attempt.
    pub async fn run(&self, mvp_id: Uuid) -> Result<(), PipelineError> {
        let _active = ActivePipelineGuard::new(Arc::clone(&self.metrics));
        let run_started = Instant::now();

        let mvp = self.store.get(mvp_id)?;
        let Some(start) = resume_index(mvp.status) else {
            return Ok(());
        };

        if mvp.execution_trace_id.is_none() {
            self.store.update(mvp_id, |m| {
                m.execution_trace_id = Some(Uuid::new_v4().to_string());
            })?;
        }

        log_stage(&mvp.name, "pipeline started");

        for spec in &STAGES[start..] {
            if let Err(e) = self
                .executor
                .execute_stage(mvp_id, spec.name, spec.target, spec.failure_state, run_started)
                .await
            {
                return Err(self.handle_failure(mvp_id, spec.name, e, run_started));
            }
        }

        self.store.transition_state(mvp_id, MvpState::Completed)?;
        let mvp = self.store.get(mvp_id)?;
        self.metrics.observe_pipeline(
            RunOutcome::Completed,
            run_started.elapsed().as_millis() as i64,
            mvp.total_cost_estimate,
            mvp.total_token_usage,
        );
        log_stage(&mvp.name, "pipeline completed");
        Ok(())
    }

    fn handle_failure(
        &self,
        mvp_id: Uuid,
        stage: &str,
        error: PipelineError,
        run_started: Instant,
    ) -> PipelineError {
        if error.is_guardrail_violation() {
            match &error {
                PipelineError::CostLimitExceeded { .. } => self.metrics.cost_limit_exceeded(),
                PipelineError::RuntimeLimitExceeded { .. } => {
                    self.metrics.runtime_limit_exceeded()
                }
                _ => {}
            }
            let _ = self.store.update(mvp_id, |m| {
                m.last_error_stage = Some("cost_or_runtime_limit".to_string());
            });
            self.fail_terminal(mvp_id, run_started);
            log_error(stage, &error);
            return error;
        }

        match self.store.update(mvp_id, |m| m.retry_count += 1) {
            Ok(updated) if updated.retry_count >= self.max_agent_retries => {
                self.fail_terminal(mvp_id, run_started);
                log_error(
                    stage,
                    &format!(
                        "retry ceiling reached ({}/{})",
                        updated.retry_count, self.max_agent_retries
                    ),
                );
            }
            Ok(updated) => {
                // Parked: recovery or an external re-trigger resumes it.
                log_error(
                    stage,
                    &format!(
                        "attempt {}/{} failed, parked in {}",
                        updated.retry_count, self.max_agent_retries, updated.status
                    ),
                );
            }
            Err(store_err) => log_error(stage, &store_err),
        }
        error
    }

    fn fail_terminal(&self, mvp_id: Uuid, run_started: Instant) {
        let failed = match self.store.get(mvp_id) {
            Ok(mvp) if crate::state_machine::is_valid_transition(mvp.status, MvpState::Failed) => {
                self.store.transition_state(mvp_id, MvpState::Failed)
            }
            _ => self.store.force_fail(mvp_id),
        };
        if let Ok(mvp) = failed {
            self.metrics.observe_pipeline(
                RunOutcome::Failed,
                run_started.elapsed().as_millis() as i64,
                mvp.total_cost_estimate,
                mvp.total_token_usage,
            );
        }
    }
}

fn log_stage(name: &str, message: &str) {
    eprintln!("  {} {name}: {message}", Style::new().cyan().apply_to("▸"));
}

fn log_error(stage: &str, error: &dyn std::fmt::Display) {
    eprintln!(
        "  {} {stage}: {error}",
        Style::new().red().bold().apply_to("✗")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardrails::Guardrails;
    use crate::metrics::InMemoryMetrics;
    use crate::runtime::StageResult;
    use crate::state_machine::AttemptStatus;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted collaborator: per-stage outcomes plus a call log.
    struct ScriptRuntime {
        outcomes: Mutex<HashMap<&'static str, Vec<StageResult>>>,
        delay: Duration,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptRuntime {
        fn all_success(cost: f64) -> Self {
            Self::new(HashMap::new()).with_default_cost(cost)
        }

        fn new(outcomes: HashMap<&'static str, Vec<StageResult>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn with_default_cost(self, cost: f64) -> Self {
            let mut outcomes = HashMap::new();
            for spec in STAGES {
                outcomes.insert(spec.name, vec![StageResult::success(100, cost)]);
            }
            Self {
                outcomes: Mutex::new(outcomes),
                ..self
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl StageRuntime for ScriptRuntime {
        async fn execute_stage(&self, stage: &str, _mvp_id: Uuid) -> StageResult {
            self.calls.lock().unwrap().push(stage.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut outcomes = self.outcomes.lock().unwrap();
            match outcomes.get_mut(stage) {
                Some(results) if !results.is_empty() => results.remove(0),
                _ => StageResult::success(100, 0.0),
            }
        }
    }

    struct Harness {
        store: Arc<MvpStore>,
        runtime: Arc<ScriptRuntime>,
        metrics: Arc<InMemoryMetrics>,
        orchestrator: PipelineOrchestrator<ScriptRuntime>,
    }

    fn harness(runtime: ScriptRuntime, max_runtime: Duration, max_retries: u32) -> Harness {
        let store = Arc::new(MvpStore::new());
        let runtime = Arc::new(runtime);
        let metrics = Arc::new(InMemoryMetrics::new());
        let guardrails = Arc::new(Guardrails::new(max_runtime, 50.0));
        let executor = StageExecutor::new(
            Arc::clone(&store),
            Arc::clone(&runtime),
            guardrails,
            metrics.clone() as Arc<dyn MetricsSink>,
        );
        let orchestrator = PipelineOrchestrator::new(
            Arc::clone(&store),
            executor,
            metrics.clone() as Arc<dyn MetricsSink>,
            max_retries,
        );
        Harness {
            store,
            runtime,
            metrics,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn happy_path_walks_all_stages_to_completed() {
        let h = harness(ScriptRuntime::all_success(0.1), Duration::from_secs(300), 3);
        let mvp = h.store.create_mvp("FitTrack", None).unwrap();

        h.orchestrator.run(mvp.id).await.unwrap();

        let after = h.store.get(mvp.id).unwrap();
        assert_eq!(after.status, MvpState::Completed);
        assert_eq!(after.retry_count, 0);
        assert!(after.execution_trace_id.is_some());
        assert!((after.total_cost_estimate - 0.5).abs() < 1e-9);
        assert_eq!(after.total_token_usage, 500);

        assert_eq!(
            h.runtime.calls(),
            vec![
                "ideation",
                "architecture",
                "building",
                "deployment",
                "tokenization"
            ]
        );

        // Exactly one attempt record per stage attempted, all completed.
        let attempts = h.store.attempts_for(mvp.id);
        assert_eq!(attempts.len(), 5);
        assert!(attempts.iter().all(|a| a.status == AttemptStatus::Completed));

        assert_eq!(h.metrics.completed_runs(), 1);
        assert_eq!(h.metrics.active_pipelines(), 0);
    }

    #[tokio::test]
    async fn failure_below_ceiling_parks_unit() {
        let mut outcomes = HashMap::new();
        outcomes.insert("building", vec![StageResult::failure("compile error")]);
        let h = harness(ScriptRuntime::new(outcomes), Duration::from_secs(300), 3);
        let mvp = h.store.create_mvp("FitTrack", None).unwrap();

        let err = h.orchestrator.run(mvp.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::StageExecution { .. }));

        let after = h.store.get(mvp.id).unwrap();
        // Parked in BUILD_FAILED; no in-process re-attempt happened.
        assert_eq!(after.status, MvpState::BuildFailed);
        assert_eq!(after.retry_count, 1);
        assert_eq!(after.last_error_stage.as_deref(), Some("building"));
        assert_eq!(
            h.runtime.calls(),
            vec!["ideation", "architecture", "building"]
        );
        // Parked is not terminal, so no failed-pipeline observation.
        assert_eq!(h.metrics.failed_runs(), 0);
        assert_eq!(h.metrics.active_pipelines(), 0);
    }

    #[tokio::test]
    async fn retry_ceiling_marks_failed() {
        let mut outcomes = HashMap::new();
        outcomes.insert("ideation", vec![StageResult::failure("still no idea")]);
        let h = harness(ScriptRuntime::new(outcomes), Duration::from_secs(300), 3);
        let mvp = h.store.create_mvp("FitTrack", None).unwrap();
        h.store.update(mvp.id, |m| m.retry_count = 2).unwrap();

        let err = h.orchestrator.run(mvp.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::StageExecution { .. }));

        let after = h.store.get(mvp.id).unwrap();
        assert_eq!(after.status, MvpState::Failed);
        assert_eq!(after.retry_count, 3);
        assert_eq!(h.metrics.failed_runs(), 1);
    }

    #[tokio::test]
    async fn cost_overshoot_trips_guardrail_before_next_stage() {
        // max_allowed_cost = 5.0; ideation and architecture cost 1.0
        // each, building reports 10.0 (post-call total 12.0), so the
        // deployment pre-check must raise CostLimitExceeded.
        let mut outcomes = HashMap::new();
        for stage in ["ideation", "architecture"] {
            outcomes.insert(stage, vec![StageResult::success(100, 1.0)]);
        }
        outcomes.insert("building", vec![StageResult::success(100, 10.0)]);
        let h = harness(ScriptRuntime::new(outcomes), Duration::from_secs(300), 3);
        let mvp = h.store.create_mvp("FitTrack", None).unwrap();
        h.store.update(mvp.id, |m| m.max_allowed_cost = 5.0).unwrap();

        let err = h.orchestrator.run(mvp.id).await.unwrap_err();
        match err {
            PipelineError::CostLimitExceeded { current, max } => {
                assert!((current - 12.0).abs() < 1e-9);
                assert!((max - 5.0).abs() < 1e-9);
            }
            other => panic!("expected CostLimitExceeded, got {other:?}"),
        }

        let after = h.store.get(mvp.id).unwrap();
        assert_eq!(after.status, MvpState::Failed);
        assert_eq!(
            after.last_error_stage.as_deref(),
            Some("cost_or_runtime_limit")
        );
        // Deployment was never delegated.
        assert_eq!(
            h.runtime.calls(),
            vec!["ideation", "architecture", "building"]
        );
        assert_eq!(h.metrics.cost_limit_hits(), 1);
        assert_eq!(h.metrics.failed_runs(), 1);
        // Guardrail violations do not count as retries.
        assert_eq!(after.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_ceiling_trips_on_second_stage() {
        // Ceiling of 1s, first stage takes 2s: the second stage's
        // pre-check must raise RuntimeLimitExceeded.
        let runtime = ScriptRuntime::all_success(0.0).with_delay(Duration::from_secs(2));
        let h = harness(runtime, Duration::from_secs(1), 3);
        let mvp = h.store.create_mvp("FitTrack", None).unwrap();

        let err = h.orchestrator.run(mvp.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::RuntimeLimitExceeded { .. }));

        assert_eq!(h.runtime.calls(), vec!["ideation"]);
        assert_eq!(h.store.get(mvp.id).unwrap().status, MvpState::Failed);
        assert_eq!(h.metrics.runtime_limit_hits(), 1);
    }

    #[tokio::test]
    async fn resume_starts_at_stage_implied_by_status() {
        let h = harness(ScriptRuntime::all_success(0.0), Duration::from_secs(300), 3);
        let mvp = h.store.create_mvp("FitTrack", None).unwrap();
        h.store.transition_state(mvp.id, MvpState::Ideating).unwrap();
        h.store
            .transition_state(mvp.id, MvpState::Architecting)
            .unwrap();
        h.store.transition_state(mvp.id, MvpState::Building).unwrap();

        h.orchestrator.run(mvp.id).await.unwrap();

        assert_eq!(
            h.runtime.calls(),
            vec!["building", "deployment", "tokenization"]
        );
        assert_eq!(h.store.get(mvp.id).unwrap().status, MvpState::Completed);
    }

    #[tokio::test]
    async fn terminal_unit_is_a_no_op() {
        let h = harness(ScriptRuntime::all_success(0.0), Duration::from_secs(300), 3);
        let mvp = h.store.create_mvp("FitTrack", None).unwrap();
        h.store.transition_state(mvp.id, MvpState::Ideating).unwrap();
        h.store.transition_state(mvp.id, MvpState::Failed).unwrap();

        h.orchestrator.run(mvp.id).await.unwrap();
        assert!(h.runtime.calls().is_empty());
        assert_eq!(h.metrics.active_pipelines(), 0);
    }

    #[test]
    fn resume_index_covers_every_state() {
        assert_eq!(resume_index(MvpState::Created), Some(0));
        assert_eq!(resume_index(MvpState::Ideating), Some(0));
        assert_eq!(resume_index(MvpState::Architecting), Some(1));
        assert_eq!(resume_index(MvpState::Building), Some(2));
        assert_eq!(resume_index(MvpState::BuildFailed), Some(2));
        assert_eq!(resume_index(MvpState::Deploying), Some(3));
        assert_eq!(resume_index(MvpState::DeployFailed), Some(3));
        assert_eq!(resume_index(MvpState::Tokenizing), Some(4));
        assert_eq!(resume_index(MvpState::Completed), None);
        assert_eq!(resume_index(MvpState::Failed), None);
    }
}
