use thiserror::Error;
use uuid::Uuid;

use crate::anthropic::ProviderError;
use crate::state_machine::MvpState;

/// Errors raised by the pipeline core.
///
/// Each variant carries a stable machine-readable code and an HTTP-like
/// status so callers can tell "ran out of budget" apart from "crashed".
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid state transition: {from} -> {to}")]
    StateTransition { from: MvpState, to: MvpState },

    #[error("pipeline already active for MVP {mvp_id} (status {status})")]
    PipelineConflict { mvp_id: Uuid, status: MvpState },

    #[error("cost limit exceeded: ${current:.2} >= ${max:.2}")]
    CostLimitExceeded { current: f64, max: f64 },

    #[error("runtime limit exceeded: {elapsed_secs}s >= {max_secs}s")]
    RuntimeLimitExceeded { elapsed_secs: u64, max_secs: u64 },

    #[error("MVP not found: {0}")]
    NotFound(Uuid),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("stage {stage} failed: {message}")]
    StageExecution { stage: String, message: String },

    #[error("LLM router error: {0}")]
    LlmRouter(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

impl PipelineError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::StateTransition { .. } => "STATE_TRANSITION_ERROR",
            PipelineError::PipelineConflict { .. } => "PIPELINE_CONFLICT",
            PipelineError::CostLimitExceeded { .. } => "COST_LIMIT_EXCEEDED",
            PipelineError::RuntimeLimitExceeded { .. } => "RUNTIME_LIMIT_EXCEEDED",
            PipelineError::NotFound(_) => "NOT_FOUND",
            PipelineError::Validation(_) => "VALIDATION_ERROR",
            PipelineError::StageExecution { .. } => "STAGE_EXECUTION_ERROR",
            PipelineError::LlmRouter(_) => "LLM_ROUTER_ERROR",
            PipelineError::Provider(_) => "PROVIDER_ERROR",
        }
    }

    /// HTTP-like status for API surfaces.
    pub fn http_status(&self) -> u16 {
        match self {
            PipelineError::StateTransition { .. } => 500,
            PipelineError::PipelineConflict { .. } => 409,
            PipelineError::CostLimitExceeded { .. } => 402,
            PipelineError::RuntimeLimitExceeded { .. } => 408,
            PipelineError::NotFound(_) => 404,
            PipelineError::Validation(_) => 422,
            PipelineError::StageExecution { .. } => 500,
            PipelineError::LlmRouter(_) => 500,
            PipelineError::Provider(_) => 502,
        }
    }

    /// Guardrail violations are fatal and must never be retried.
    pub fn is_guardrail_violation(&self) -> bool {
        matches!(
            self,
            PipelineError::CostLimitExceeded { .. } | PipelineError::RuntimeLimitExceeded { .. }
        )
    }
}
