//! Executes one pipeline stage: guardrail checks, the in-flight state
//! transition, the attempt audit record and the delegation to the
//! AI-runtime collaborator.

use std::sync::Arc;

use tokio::time::Instant;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::guardrails::Guardrails;
use crate::metrics::MetricsSink;
use crate::runtime::StageRuntime;
use crate::state_machine::{MvpState, StageAttempt};
use crate::store::MvpStore;

pub struct StageExecutor<R: StageRuntime> {
    store: Arc<MvpStore>,
    runtime: Arc<R>,
    guardrails: Arc<Guardrails>,
    metrics: Arc<dyn MetricsSink>,
}

impl<R: StageRuntime> StageExecutor<R> {
    pub fn new(
        store: Arc<MvpStore>,
        runtime: Arc<R>,
        guardrails: Arc<Guardrails>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            runtime,
            guardrails,
            metrics,
        }
    }

    /// Run one stage attempt for `mvp_id`.
    ///
    /// Guardrail violations propagate before any state is touched.
    /// Stage failures close the attempt record, mark
    /// `last_error_stage`, move to `failure_state` when the stage
    /// defines one, and re-raise for the orchestrator's retry
    /// bookkeeping.
    pub async fn execute_stage(
        &self,
        mvp_id: Uuid,
        stage: &str,
        target_state: MvpState,
        failure_state: Option<MvpState>,
        run_started: Instant,
    ) -> Result<(), PipelineError> {
        let mvp = self.store.get(mvp_id)?;

        self.guardrails.check_runtime(run_started)?;
        self.guardrails.check_cost(&mvp)?;

        // Mark the stage in flight. Recovery re-enters a stage whose
        // persisted status already is the target; that is not an error.
        if mvp.status != target_state {
            self.store.transition_state(mvp_id, target_state)?;
        }

        let mut attempt = StageAttempt::open(mvp_id, stage, mvp.retry_count + 1);
        self.store.record_attempt_open(&attempt);

        match self.run_attempt(&mut attempt, stage, mvp_id, failure_state).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // An attempt record must never remain running: whatever
                // went wrong past this point, close it with the real
                // duration before re-raising.
                if attempt.is_running() {
                    attempt.close_failed(format!("stage {stage} failed: {e}"));
                    let _ = self.store.record_attempt_close(&attempt);
                    let _ = self.store.update(mvp_id, |m| {
                        m.last_error_stage = Some(stage.to_string());
                    });
                }
                Err(e)
            }
        }
    }

    async fn run_attempt(
        &self,
        attempt: &mut StageAttempt,
        stage: &str,
        mvp_id: Uuid,
        failure_state: Option<MvpState>,
    ) -> Result<(), PipelineError> {
        let result = self.runtime.execute_stage(stage, mvp_id).await;

        if result.success {
            attempt.close_completed(
                result.stage_input,
                result.stage_output,
                result.model,
                result.token_usage,
                result.cost_estimate,
                result.logs.join("\n"),
            );
            self.store.record_attempt_close(attempt)?;
            self.store.update(mvp_id, |mvp| {
                mvp.total_token_usage += result.token_usage;
                mvp.total_cost_estimate += result.cost_estimate;
            })?;
            self.metrics.observe_stage(
                stage,
                true,
                attempt.duration_ms.unwrap_or(0),
                result.cost_estimate,
                result.token_usage,
            );
            Ok(())
        } else {
            let error = result
                .error
                .unwrap_or_else(|| "stage reported failure without detail".to_string());
            attempt.close_failed(error.clone());
            self.store.record_attempt_close(attempt)?;
            self.store.update(mvp_id, |mvp| {
                mvp.last_error_stage = Some(stage.to_string());
            })?;
            self.metrics
                .observe_stage(stage, false, attempt.duration_ms.unwrap_or(0), 0.0, 0);

            if let Some(failure_state) = failure_state {
                self.store.transition_state(mvp_id, failure_state)?;
            }

            Err(PipelineError::StageExecution {
                stage: stage.to_string(),
                message: error,
            })
        }
    }
}
