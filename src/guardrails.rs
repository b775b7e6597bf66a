//! Cost and runtime ceilings checked before every stage attempt.
//!
//! Both checks are synchronous and evaluated only at stage boundaries:
//! a stage already in flight is never preempted. Violations are fatal
//! and never retried.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::PipelineError;
use crate::state_machine::Mvp;

/// Notification hook for cost overruns. Implementations do their own
/// delivery; the pipeline only fires and forgets.
pub trait CostAlerter: Send + Sync + 'static {
    fn alert(&self, current_cost: f64, threshold: f64);
}

pub struct Guardrails {
    max_total_runtime: Duration,
    alert_cost_threshold: f64,
    alerter: Option<Arc<dyn CostAlerter>>,
}

impl Guardrails {
    pub fn new(max_total_runtime: Duration, alert_cost_threshold: f64) -> Self {
        Self {
            max_total_runtime,
            alert_cost_threshold,
            alerter: None,
        }
    }

    pub fn with_alerter(mut self, alerter: Arc<dyn CostAlerter>) -> Self {
        self.alerter = Some(alerter);
        self
    }

    /// Cumulative cost ceiling. Raises once the accumulated estimate
    /// reaches the MVP's own ceiling; additionally fires a detached
    /// notification when the larger alert threshold is crossed. The
    /// notification runs in its own task so its failure can never block
    /// or fail the stage.
    pub fn check_cost(&self, mvp: &Mvp) -> Result<(), PipelineError> {
        if mvp.total_cost_estimate < mvp.max_allowed_cost {
            return Ok(());
        }

        if mvp.total_cost_estimate >= self.alert_cost_threshold
            && let Some(alerter) = &self.alerter
        {
            let alerter = Arc::clone(alerter);
            let current = mvp.total_cost_estimate;
            let threshold = self.alert_cost_threshold;
            tokio::spawn(async move {
                alerter.alert(current, threshold);
            });
        }

        Err(PipelineError::CostLimitExceeded {
            current: mvp.total_cost_estimate,
            max: mvp.max_allowed_cost,
        })
    }

    /// Wall-clock ceiling measured from orchestrator start.
    pub fn check_runtime(&self, run_started: Instant) -> Result<(), PipelineError> {
        let elapsed = run_started.elapsed();
        if elapsed >= self.max_total_runtime {
            return Err(PipelineError::RuntimeLimitExceeded {
                elapsed_secs: elapsed.as_secs(),
                max_secs: self.max_total_runtime.as_secs(),
            });
        }
        Ok(())
    }
}
