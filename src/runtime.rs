//! The AI-runtime collaborator: executes one pipeline stage on behalf
//! of the stage executor.
//!
//! The contract is deliberately infallible: expected failures come back
//! as `success = false` with the error text, never as a panic or an
//! `Err`. Stage side effects must be safe to repeat, since crash
//! recovery re-executes the stage implied by the persisted status.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::sleep;
use uuid::Uuid;

use crate::anthropic::CompletionClient;
use crate::error::PipelineError;
use crate::router::{LlmResponse, LlmRouter, ResponseSchema, TaskType};
use crate::state_machine::Mvp;
use crate::store::MvpStore;

/// Structured result of one stage execution.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub success: bool,
    pub stage_input: Option<serde_json::Value>,
    pub stage_output: Option<serde_json::Value>,
    pub model: Option<String>,
    pub token_usage: u64,
    pub cost_estimate: f64,
    pub logs: Vec<String>,
    pub error: Option<String>,
}

impl StageResult {
    pub fn success(token_usage: u64, cost_estimate: f64) -> Self {
        Self {
            success: true,
            stage_input: None,
            stage_output: None,
            model: None,
            token_usage,
            cost_estimate,
            logs: Vec::new(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            stage_input: None,
            stage_output: None,
            model: None,
            token_usage: 0,
            cost_estimate: 0.0,
            logs: Vec::new(),
            error: Some(error.into()),
        }
    }
}

pub trait StageRuntime: Send + Sync {
    fn execute_stage(
        &self,
        stage: &str,
        mvp_id: Uuid,
    ) -> impl Future<Output = StageResult> + Send;
}

/// LLM-backed runtime: assembles a stage prompt, routes it through the
/// LLM router and writes result artifacts back onto the MVP record.
pub struct LlmStageRuntime<C: CompletionClient> {
    router: LlmRouter<C>,
    store: Arc<MvpStore>,
    /// Pause inserted before each delegated call to respect upstream
    /// provider throughput limits.
    stage_delay: Duration,
    /// Ordered fallback models consulted when the provider throttles.
    fallbacks: Vec<String>,
    cursors: Mutex<HashMap<TaskType, usize>>,
}

impl<C: CompletionClient> LlmStageRuntime<C> {
    pub fn new(
        router: LlmRouter<C>,
        store: Arc<MvpStore>,
        stage_delay: Duration,
        fallbacks: Vec<String>,
    ) -> Self {
        Self {
            router,
            store,
            stage_delay,
            fallbacks,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn router(&self) -> &LlmRouter<C> {
        &self.router
    }

    /// Next fallback model for a task, advancing that task's cursor.
    fn next_fallback(&self, task: TaskType) -> Option<String> {
        if self.fallbacks.is_empty() {
            return None;
        }
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        let cursor = cursors.entry(task).or_insert(0);
        let model = self.fallbacks[*cursor % self.fallbacks.len()].clone();
        *cursor += 1;
        Some(model)
    }

    async fn call_with_fallback(
        &self,
        task: TaskType,
        prompt: &str,
        schema: &ResponseSchema,
    ) -> Result<LlmResponse, PipelineError> {
        let mut result = self
            .router
            .execute_llm_call(task, prompt, Some(schema), None)
            .await;

        let mut rotations = 0;
        while let Err(ref err) = result {
            let throttled = matches!(err, PipelineError::Provider(e) if e.is_throttle());
            if !throttled || rotations >= self.fallbacks.len() {
                break;
            }
            let Some(model) = self.next_fallback(task) else {
                break;
            };
            rotations += 1;
            result = self
                .router
                .execute_with_model(&model, prompt, Some(schema), None)
                .await;
        }
        result
    }

    fn apply_artifacts(&self, mvp_id: Uuid, task: TaskType, parsed: &serde_json::Value) {
        let _ = self.store.update(mvp_id, |mvp| match task {
            TaskType::Ideation => {
                if let Some(summary) = parsed["idea_summary"].as_str() {
                    mvp.idea_summary = Some(summary.to_string());
                }
            }
            TaskType::Deployment => {
                if let Some(url) = parsed["deployment_url"].as_str() {
                    mvp.deployment_url = Some(url.to_string());
                }
            }
            TaskType::Tokenization => {
                if let Some(token) = parsed["token_id"].as_str() {
                    mvp.token_id = Some(token.to_string());
                }
            }
            _ => {}
        });
    }
}

impl<C: CompletionClient> StageRuntime for LlmStageRuntime<C> {
    async fn execute_stage(&self, stage: &str, mvp_id: Uuid) -> StageResult {
        let Some(task) = TaskType::from_stage(stage) else {
            return StageResult::failure(format!("unknown stage: {stage}"));
        };
        let mvp = match self.store.get(mvp_id) {
            Ok(mvp) => mvp,
            Err(e) => return StageResult::failure(e.to_string()),
        };

        let prompt = stage_prompt(task, &mvp);
        let schema = stage_schema(task);

        sleep(self.stage_delay).await;

        match self.call_with_fallback(task, &prompt, &schema).await {
            Ok(resp) => {
                if let Some(parsed) = &resp.parsed_output {
                    self.apply_artifacts(mvp_id, task, parsed);
                }
                StageResult {
                    success: true,
                    stage_input: Some(serde_json::json!({
                        "stage": stage,
                        "task": task.as_str(),
                        "mvp": mvp.name,
                        "model": resp.model,
                    })),
                    stage_output: resp
                        .parsed_output
                        .clone()
                        .or_else(|| Some(serde_json::Value::String(resp.raw_output.clone()))),
                    model: Some(resp.model),
                    token_usage: resp.token_usage,
                    cost_estimate: resp.cost_estimate,
                    logs: vec![format!("stage {stage} completed")],
                    error: None,
                }
            }
            Err(e) => StageResult::failure(e.to_string()),
        }
    }
}

fn stage_prompt(task: TaskType, mvp: &Mvp) -> String {
    let context = mvp
        .idea_summary
        .as_deref()
        .unwrap_or("no summary captured yet");
    match task {
        TaskType::Ideation => format!(
            "Refine the product idea for an MVP named \"{}\".\n\
             Respond with ONLY valid JSON: {{\"idea_summary\": \"<two sentence summary>\"}}\n\
             Initial notes: {context}",
            mvp.name
        ),
        TaskType::Architecture => format!(
            "Design the technical architecture for the MVP \"{}\" ({context}).\n\
             Respond with ONLY valid JSON: {{\"architecture\": {{...}}}}",
            mvp.name
        ),
        TaskType::Building => format!(
            "Produce the build plan and artifact manifest for the MVP \"{}\" ({context}).\n\
             Respond with ONLY valid JSON: {{\"artifacts\": [...]}}",
            mvp.name
        ),
        TaskType::Deployment => format!(
            "Deploy the built MVP \"{}\" and report the public URL.\n\
             Respond with ONLY valid JSON: {{\"deployment_url\": \"<url>\"}}",
            mvp.name
        ),
        TaskType::Tokenization => format!(
            "Mint the launch token for the MVP \"{}\" and report its identifier.\n\
             Respond with ONLY valid JSON: {{\"token_id\": \"<id>\"}}",
            mvp.name
        ),
        TaskType::Summary => format!(
            "Summarize the current state of the MVP \"{}\" in one paragraph.",
            mvp.name
        ),
    }
}

fn stage_schema(task: TaskType) -> ResponseSchema {
    match task {
        TaskType::Ideation => ResponseSchema::with_required(&["idea_summary"]),
        TaskType::Architecture => ResponseSchema::with_required(&["architecture"]),
        TaskType::Building => ResponseSchema::with_required(&["artifacts"]),
        TaskType::Deployment => ResponseSchema::with_required(&["deployment_url"]),
        TaskType::Tokenization => ResponseSchema::with_required(&["token_id"]),
        TaskType::Summary => ResponseSchema::with_required(&[]),
    }
}
