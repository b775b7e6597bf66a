use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::MvpState;

/// Default cumulative cost ceiling per MVP, in USD.
pub const DEFAULT_MAX_ALLOWED_COST: f64 = 10.0;

/// One MVP making its way through the pipeline. Aggregate root: all
/// status changes go through validated transitions, and the running
/// totals never decrease within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mvp {
    pub id: Uuid,
    pub name: String,
    pub status: MvpState,
    pub idea_summary: Option<String>,
    pub deployment_url: Option<String>,
    pub token_id: Option<String>,
    pub retry_count: u32,
    pub total_token_usage: u64,
    pub total_cost_estimate: f64,
    pub max_allowed_cost: f64,
    pub execution_trace_id: Option<String>,
    pub last_error_stage: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Mvp {
    pub fn new(name: String, idea_summary: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            status: MvpState::Created,
            idea_summary,
            deployment_url: None,
            token_id: None,
            retry_count: 0,
            total_token_usage: 0,
            total_cost_estimate: 0.0,
            max_allowed_cost: DEFAULT_MAX_ALLOWED_COST,
            execution_trace_id: None,
            last_error_stage: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Lifecycle status of one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Running,
    Completed,
    Failed,
}

/// Append-only audit record for one execution attempt of one stage.
///
/// Opened when the stage starts, closed exactly once when it ends.
/// A record must never remain `Running` after its stage has exited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageAttempt {
    pub id: Uuid,
    pub mvp_id: Uuid,
    pub stage: String,
    pub status: AttemptStatus,
    pub attempt_number: u32,
    pub stage_input: Option<serde_json::Value>,
    pub stage_output: Option<serde_json::Value>,
    pub llm_model: Option<String>,
    pub token_usage: u64,
    pub cost_estimate: f64,
    pub log: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl StageAttempt {
    /// Open a new attempt record in the `Running` state.
    pub fn open(mvp_id: Uuid, stage: &str, attempt_number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            mvp_id,
            stage: stage.to_string(),
            status: AttemptStatus::Running,
            attempt_number,
            stage_input: None,
            stage_output: None,
            llm_model: None,
            token_usage: 0,
            cost_estimate: 0.0,
            log: String::new(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Close the record as completed with the stage's outputs.
    pub fn close_completed(
        &mut self,
        stage_input: Option<serde_json::Value>,
        stage_output: Option<serde_json::Value>,
        llm_model: Option<String>,
        token_usage: u64,
        cost_estimate: f64,
        log: String,
    ) {
        self.status = AttemptStatus::Completed;
        self.stage_input = stage_input;
        self.stage_output = stage_output;
        self.llm_model = llm_model;
        self.token_usage = token_usage;
        self.cost_estimate = cost_estimate;
        self.log = log;
        self.seal();
    }

    /// Close the record as failed, keeping the raw error text.
    pub fn close_failed(&mut self, log: String) {
        self.status = AttemptStatus::Failed;
        self.log = log;
        self.seal();
    }

    pub fn is_running(&self) -> bool {
        self.status == AttemptStatus::Running
    }

    // Stamps completed_at and duration_ms from started_at.
    fn seal(&mut self) {
        let completed_at = Utc::now();
        self.completed_at = Some(completed_at);
        self.duration_ms = Some((completed_at - self.started_at).num_milliseconds());
    }
}
