//! LLM routing and cost accounting.
//!
//! [`LlmRouter`] resolves each task type to a model, executes provider
//! calls with schema-validated retries, and accounts token usage and
//! cost into a run-scoped [`UsageLedger`]. Pricing is keyed by a
//! structured `(provider, model)` pair with an explicit default rate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::anthropic::{Completion, CompletionClient};
use crate::config::ModelConfig;
use crate::error::PipelineError;

const MAX_OUTPUT_TOKENS: u32 = 4096;

/// Tokens-per-word heuristic used when neither the provider nor a
/// tokenizer can tell us the real count.
const TOKENS_PER_WORD: f64 = 1.3;

/// Task types the router knows how to place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Ideation,
    Architecture,
    Building,
    Deployment,
    Tokenization,
    Summary,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Ideation => "IDEATION",
            TaskType::Architecture => "ARCHITECTURE",
            TaskType::Building => "BUILDING",
            TaskType::Deployment => "DEPLOYMENT",
            TaskType::Tokenization => "TOKENIZATION",
            TaskType::Summary => "SUMMARY",
        }
    }

    /// Map a pipeline stage name to its task type.
    pub fn from_stage(stage: &str) -> Option<TaskType> {
        match stage {
            "ideation" => Some(TaskType::Ideation),
            "architecture" => Some(TaskType::Architecture),
            "building" => Some(TaskType::Building),
            "deployment" => Some(TaskType::Deployment),
            "tokenization" => Some(TaskType::Tokenization),
            _ => None,
        }
    }
}

/// Structured pricing key. Free-text model names are never substring
/// matched against the table; an exact key either exists or the default
/// rate applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub provider: String,
    pub model: String,
}

impl ModelKey {
    pub fn anthropic(model: &str) -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: model.to_string(),
        }
    }
}

/// USD per 1K tokens.
#[derive(Debug, Clone, Copy)]
pub struct ModelRates {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

pub struct PricingTable {
    rates: HashMap<ModelKey, ModelRates>,
    default_rates: ModelRates,
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut rates = HashMap::new();
        rates.insert(
            ModelKey::anthropic("claude-haiku-4-5-20251001"),
            ModelRates {
                input_per_1k: 0.001,
                output_per_1k: 0.005,
            },
        );
        rates.insert(
            ModelKey::anthropic("claude-sonnet-4-5-20250929"),
            ModelRates {
                input_per_1k: 0.003,
                output_per_1k: 0.015,
            },
        );
        rates.insert(
            ModelKey::anthropic("claude-opus-4-6"),
            ModelRates {
                input_per_1k: 0.015,
                output_per_1k: 0.075,
            },
        );
        Self {
            rates,
            default_rates: ModelRates {
                input_per_1k: 0.01,
                output_per_1k: 0.03,
            },
        }
    }
}

impl PricingTable {
    pub fn rates_for(&self, key: &ModelKey) -> ModelRates {
        self.rates.get(key).copied().unwrap_or(self.default_rates)
    }

    /// cost = (input/1000) * input_rate + (output/1000) * output_rate
    pub fn estimate_cost(&self, key: &ModelKey, input_tokens: u64, output_tokens: u64) -> f64 {
        let rates = self.rates_for(key);
        (input_tokens as f64 / 1000.0) * rates.input_per_1k
            + (output_tokens as f64 / 1000.0) * rates.output_per_1k
    }
}

/// Running totals. Monotonic: recorded values are only ever added.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageTotals {
    pub total_tokens_used: u64,
    pub total_cost: f64,
}

/// Concurrency-safe usage accumulator scoped to one pipeline run.
///
/// The router records every attempt here, and the multi-agent execution
/// layer reports delegated sub-agent usage into the same ledger
/// out-of-band, so [`LlmRouter::get_usage_stats`] sees both.
#[derive(Default)]
pub struct UsageLedger {
    totals: Mutex<UsageTotals>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tokens: u64, cost: f64) {
        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        totals.total_tokens_used += tokens;
        totals.total_cost += cost;
    }

    pub fn totals(&self) -> UsageTotals {
        *self.totals.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Hook for a model-aware tokenizer. Returning `None` falls back to the
/// word-count heuristic.
pub trait TokenEstimator: Send + Sync {
    fn count_tokens(&self, model: &str, text: &str) -> Option<u64>;
}

/// Expected shape of a structured LLM response: the set of top-level
/// keys that must be present after parsing.
#[derive(Debug, Clone)]
pub struct ResponseSchema {
    required: Vec<String>,
}

impl ResponseSchema {
    pub fn with_required(fields: &[&str]) -> Self {
        Self {
            required: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn validate(&self, value: &serde_json::Value) -> Result<(), String> {
        let object = value
            .as_object()
            .ok_or_else(|| "response is not a JSON object".to_string())?;
        for field in &self.required {
            if !object.contains_key(field) {
                return Err(format!("missing required field: {field}"));
            }
        }
        Ok(())
    }
}

/// Structured result of one routed LLM call.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub model: String,
    pub token_usage: u64,
    pub cost_estimate: f64,
    pub raw_output: String,
    pub parsed_output: Option<serde_json::Value>,
}

pub struct LlmRouter<C: CompletionClient> {
    client: C,
    models: ModelConfig,
    pricing: PricingTable,
    max_retries: u32,
    ledger: Arc<UsageLedger>,
    local: UsageLedger,
    estimator: Option<Box<dyn TokenEstimator>>,
}

impl<C: CompletionClient> LlmRouter<C> {
    pub fn new(client: C, models: ModelConfig, max_retries: u32, ledger: Arc<UsageLedger>) -> Self {
        Self {
            client,
            models,
            pricing: PricingTable::default(),
            max_retries,
            ledger,
            local: UsageLedger::new(),
            estimator: None,
        }
    }

    pub fn with_estimator(mut self, estimator: Box<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Static task-type → model lookup.
    pub fn get_model_for_task(&self, task_type: TaskType) -> &str {
        match task_type {
            TaskType::Ideation => &self.models.ideation,
            TaskType::Architecture => &self.models.architecture,
            TaskType::Building => &self.models.building,
            TaskType::Deployment => &self.models.deployment,
            TaskType::Tokenization => &self.models.tokenization,
            TaskType::Summary => &self.models.summary,
        }
    }

    /// Execute an LLM call routed by task type.
    pub async fn execute_llm_call(
        &self,
        task_type: TaskType,
        prompt: &str,
        response_schema: Option<&ResponseSchema>,
        max_retries: Option<u32>,
    ) -> Result<LlmResponse, PipelineError> {
        let model = self.get_model_for_task(task_type).to_string();
        self.execute_with_model(&model, prompt, response_schema, max_retries)
            .await
    }

    /// Execute against an explicit model (used by the runtime's throttle
    /// fallback rotation).
    pub async fn execute_with_model(
        &self,
        model: &str,
        prompt: &str,
        response_schema: Option<&ResponseSchema>,
        max_retries: Option<u32>,
    ) -> Result<LlmResponse, PipelineError> {
        let max_retries = max_retries.unwrap_or(self.max_retries);
        let mut prompt = prompt.to_string();

        for attempt in 1..=max_retries {
            match self.client.complete(model, &prompt, MAX_OUTPUT_TOKENS).await {
                Ok(completion) => {
                    let (input_tokens, output_tokens) =
                        self.token_counts(model, &prompt, &completion);
                    let token_usage = input_tokens + output_tokens;
                    let cost = self.pricing.estimate_cost(
                        &ModelKey::anthropic(model),
                        input_tokens,
                        output_tokens,
                    );

                    // Every attempt is accounted, including ones whose
                    // output fails validation below: the spend is real.
                    self.local.record(token_usage, cost);
                    self.ledger.record(token_usage, cost);

                    let parsed_output = match response_schema {
                        None => None,
                        Some(schema) => match parse_and_validate(&completion.content, schema) {
                            Ok(value) => Some(value),
                            Err(reason) if attempt < max_retries => {
                                prompt = format!(
                                    "{prompt}\n\nThe previous response was invalid ({reason}). \
                                     Respond with ONLY a valid JSON object containing the \
                                     required fields, no other text."
                                );
                                continue;
                            }
                            Err(reason) => {
                                return Err(PipelineError::LlmRouter(format!(
                                    "failed to get valid JSON after {max_retries} attempts: {reason}"
                                )));
                            }
                        },
                    };

                    return Ok(LlmResponse {
                        model: model.to_string(),
                        token_usage,
                        cost_estimate: cost,
                        raw_output: completion.content,
                        parsed_output,
                    });
                }
                // Throttling surfaces with its class intact so the
                // runtime can rotate to a fallback model.
                Err(e) if e.is_throttle() => return Err(PipelineError::Provider(e)),
                Err(e) if attempt < max_retries => {
                    sleep(Duration::from_secs(1u64 << attempt)).await;
                }
                Err(e) => {
                    return Err(PipelineError::LlmRouter(format!(
                        "LLM call failed after {max_retries} attempts: {e}"
                    )));
                }
            }
        }

        Err(PipelineError::LlmRouter(
            "unexpected error in LLM execution".into(),
        ))
    }

    /// Totals visible to this router: the maximum of its own records and
    /// the shared ledger (which also receives out-of-band sub-agent
    /// usage). Never reset, never double-counted.
    pub fn get_usage_stats(&self) -> UsageTotals {
        let local = self.local.totals();
        let shared = self.ledger.totals();
        UsageTotals {
            total_tokens_used: local.total_tokens_used.max(shared.total_tokens_used),
            total_cost: local.total_cost.max(shared.total_cost),
        }
    }

    fn token_counts(&self, model: &str, prompt: &str, completion: &Completion) -> (u64, u64) {
        if let Some(usage) = completion.usage {
            return (usage.input_tokens, usage.output_tokens);
        }
        if let Some(estimator) = &self.estimator
            && let Some(input) = estimator.count_tokens(model, prompt)
            && let Some(output) = estimator.count_tokens(model, &completion.content)
        {
            return (input, output);
        }
        (estimate_tokens(prompt), estimate_tokens(completion.content.as_str()))
    }
}

/// Word-count heuristic: ~1.3 tokens per word.
fn estimate_tokens(text: &str) -> u64 {
    (text.split_whitespace().count() as f64 * TOKENS_PER_WORD).round() as u64
}

/// Strip a Markdown code fence (with optional language tag) around a
/// response body.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.strip_suffix("```").map(str::trim).unwrap_or(rest.trim())
}

/// Extract the first balanced `{...}` block, honoring string literals.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let bytes = raw.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_and_validate(
    raw: &str,
    schema: &ResponseSchema,
) -> Result<serde_json::Value, String> {
    let cleaned = strip_code_fences(raw);
    let value = match serde_json::from_str::<serde_json::Value>(cleaned) {
        Ok(value) => value,
        Err(_) => {
            let block = extract_json_object(cleaned)
                .ok_or_else(|| "no JSON object found in response".to_string())?;
            serde_json::from_str::<serde_json::Value>(block)
                .map_err(|e| format!("invalid JSON: {e}"))?
        }
    };
    schema.validate(&value)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic::{ProviderError, Usage};
    use std::collections::VecDeque;

    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<Completion, ProviderError>>>,
        calls: std::sync::atomic::AtomicU32,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<Completion, ProviderError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: std::sync::atomic::AtomicU32::new(0),
            }
        }

        fn ok(text: &str, usage: Option<Usage>) -> Result<Completion, ProviderError> {
            Ok(Completion {
                content: text.to_string(),
                model: "scripted".into(),
                usage,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl CompletionClient for ScriptedClient {
        async fn complete(
            &self,
            _model: &str,
            _prompt: &str,
            _max_tokens: u32,
        ) -> Result<Completion, ProviderError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(ProviderError::Api {
                        status: 500,
                        message: "script exhausted".into(),
                    })
                })
        }
    }

    fn router_with(
        responses: Vec<Result<Completion, ProviderError>>,
    ) -> (LlmRouter<ScriptedClient>, Arc<UsageLedger>) {
        let ledger = Arc::new(UsageLedger::new());
        let router = LlmRouter::new(
            ScriptedClient::new(responses),
            ModelConfig::default(),
            3,
            Arc::clone(&ledger),
        );
        (router, ledger)
    }

    fn usage(input: u64, output: u64) -> Option<Usage> {
        Some(Usage {
            input_tokens: input,
            output_tokens: output,
        })
    }

    // --- routing and pricing ---

    #[test]
    fn routes_task_to_configured_model() {
        let (router, _) = router_with(vec![]);
        assert_eq!(
            router.get_model_for_task(TaskType::Architecture),
            "claude-opus-4-6"
        );
        assert_eq!(
            router.get_model_for_task(TaskType::Deployment),
            "claude-haiku-4-5-20251001"
        );
    }

    #[test]
    fn cost_formula_uses_per_1k_rates() {
        let pricing = PricingTable::default();
        let cost = pricing.estimate_cost(
            &ModelKey::anthropic("claude-sonnet-4-5-20250929"),
            1000,
            1000,
        );
        assert!((cost - 0.018).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_uses_default_rates() {
        let pricing = PricingTable::default();
        let cost = pricing.estimate_cost(&ModelKey::anthropic("mystery-model"), 1000, 1000);
        assert!((cost - 0.04).abs() < 1e-9);

        // Exact keys only: a prefix of a known model is still unknown.
        let cost = pricing.estimate_cost(&ModelKey::anthropic("claude"), 1000, 1000);
        assert!((cost - 0.04).abs() < 1e-9);
    }

    // --- token counting ---

    #[test]
    fn word_heuristic_estimate() {
        assert_eq!(estimate_tokens("one two three four"), 5); // 4 * 1.3 = 5.2 → 5
        assert_eq!(estimate_tokens(""), 0);
    }

    #[tokio::test]
    async fn provider_usage_preferred_over_heuristic() {
        let (router, _) = router_with(vec![ScriptedClient::ok("short", usage(100, 200))]);
        let resp = router
            .execute_llm_call(TaskType::Summary, "prompt", None, None)
            .await
            .unwrap();
        assert_eq!(resp.token_usage, 300);
    }

    #[tokio::test]
    async fn heuristic_used_when_usage_absent() {
        let (router, _) = router_with(vec![ScriptedClient::ok("three word reply", None)]);
        let resp = router
            .execute_llm_call(TaskType::Summary, "a four word prompt", None, None)
            .await
            .unwrap();
        // 4 words * 1.3 = 5.2 → 5; 3 words * 1.3 = 3.9 → 4
        assert_eq!(resp.token_usage, 9);
    }

    struct FixedEstimator;
    impl TokenEstimator for FixedEstimator {
        fn count_tokens(&self, _model: &str, _text: &str) -> Option<u64> {
            Some(42)
        }
    }

    #[tokio::test]
    async fn estimator_used_before_heuristic() {
        let ledger = Arc::new(UsageLedger::new());
        let router = LlmRouter::new(
            ScriptedClient::new(vec![ScriptedClient::ok("reply", None)]),
            ModelConfig::default(),
            3,
            ledger,
        )
        .with_estimator(Box::new(FixedEstimator));

        let resp = router
            .execute_llm_call(TaskType::Summary, "prompt", None, None)
            .await
            .unwrap();
        assert_eq!(resp.token_usage, 84);
    }

    // --- schema validation and retry ---

    #[tokio::test]
    async fn schema_valid_on_first_attempt() {
        let (router, _) = router_with(vec![ScriptedClient::ok(
            r#"{"idea": "app", "score": 8}"#,
            usage(10, 10),
        )]);
        let schema = ResponseSchema::with_required(&["idea", "score"]);
        let resp = router
            .execute_llm_call(TaskType::Ideation, "prompt", Some(&schema), None)
            .await
            .unwrap();
        let parsed = resp.parsed_output.unwrap();
        assert_eq!(parsed["idea"], "app");
    }

    #[tokio::test]
    async fn schema_failure_then_success_retries_with_correction() {
        let client = ScriptedClient::new(vec![
            ScriptedClient::ok("not json at all", usage(10, 10)),
            ScriptedClient::ok(r#"{"idea": "app"}"#, usage(10, 10)),
        ]);
        let ledger = Arc::new(UsageLedger::new());
        let router = LlmRouter::new(client, ModelConfig::default(), 3, Arc::clone(&ledger));

        let schema = ResponseSchema::with_required(&["idea"]);
        let resp = router
            .execute_llm_call(TaskType::Ideation, "prompt", Some(&schema), None)
            .await
            .unwrap();

        assert!(resp.parsed_output.is_some());
        assert_eq!(router.client.calls(), 2);
    }

    #[tokio::test]
    async fn failed_validation_attempts_accumulate() {
        // Both attempts carry 20 tokens each; the failed first attempt
        // still counts toward the totals.
        let (router, ledger) = router_with(vec![
            ScriptedClient::ok("garbage", usage(10, 10)),
            ScriptedClient::ok(r#"{"idea": "app"}"#, usage(10, 10)),
        ]);
        let schema = ResponseSchema::with_required(&["idea"]);
        router
            .execute_llm_call(TaskType::Ideation, "prompt", Some(&schema), None)
            .await
            .unwrap();

        assert_eq!(ledger.totals().total_tokens_used, 40);
        assert_eq!(router.get_usage_stats().total_tokens_used, 40);
    }

    #[tokio::test]
    async fn schema_exhaustion_raises_router_error() {
        let (router, _) = router_with(vec![
            ScriptedClient::ok("bad", usage(1, 1)),
            ScriptedClient::ok("still bad", usage(1, 1)),
            ScriptedClient::ok("worse", usage(1, 1)),
        ]);
        let schema = ResponseSchema::with_required(&["idea"]);
        let err = router
            .execute_llm_call(TaskType::Ideation, "prompt", Some(&schema), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::LlmRouter(_)));
        assert_eq!(err.code(), "LLM_ROUTER_ERROR");
    }

    // --- provider errors ---

    #[tokio::test(start_paused = true)]
    async fn provider_error_backs_off_and_retries() {
        let (router, _) = router_with(vec![
            Err(ProviderError::Api {
                status: 500,
                message: "boom".into(),
            }),
            ScriptedClient::ok("recovered", usage(5, 5)),
        ]);
        let resp = router
            .execute_llm_call(TaskType::Summary, "prompt", None, None)
            .await
            .unwrap();
        assert_eq!(resp.raw_output, "recovered");
        assert_eq!(router.client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_exhaustion_raises_router_error() {
        let (router, _) = router_with(vec![
            Err(ProviderError::Api {
                status: 500,
                message: "a".into(),
            }),
            Err(ProviderError::Api {
                status: 500,
                message: "b".into(),
            }),
            Err(ProviderError::Api {
                status: 500,
                message: "c".into(),
            }),
        ]);
        let err = router
            .execute_llm_call(TaskType::Summary, "prompt", None, None)
            .await
            .unwrap_err();
        match err {
            PipelineError::LlmRouter(msg) => assert!(msg.contains("after 3 attempts")),
            other => panic!("expected LlmRouter, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn throttle_surfaces_with_class_intact() {
        let (router, _) = router_with(vec![Err(ProviderError::RateLimited {
            retry_after_ms: 2000,
        })]);
        let err = router
            .execute_llm_call(TaskType::Building, "prompt", None, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Provider(ProviderError::RateLimited { .. })
        ));
        assert_eq!(router.client.calls(), 1);
    }

    // --- usage ledger ---

    #[tokio::test]
    async fn usage_stats_report_max_of_local_and_ledger() {
        let (router, ledger) = router_with(vec![ScriptedClient::ok("reply", usage(50, 50))]);
        router
            .execute_llm_call(TaskType::Summary, "prompt", None, None)
            .await
            .unwrap();

        // Out-of-band sub-agent usage lands only in the shared ledger.
        ledger.record(900, 1.5);

        let stats = router.get_usage_stats();
        assert_eq!(stats.total_tokens_used, 1000);
        assert!((stats.total_cost - ledger.totals().total_cost).abs() < 1e-9);
    }

    // --- parsing helpers ---

    #[test]
    fn strips_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn extracts_first_balanced_object() {
        let raw = r#"Here you go: {"a": {"b": 1}, "c": "}"} trailing"#;
        assert_eq!(extract_json_object(raw), Some(r#"{"a": {"b": 1}, "c": "}"}"#));
        assert_eq!(extract_json_object("no braces"), None);
    }

    #[test]
    fn parse_and_validate_falls_back_to_extraction() {
        let schema = ResponseSchema::with_required(&["a"]);
        let value = parse_and_validate("The answer is {\"a\": 1} hope it helps", &schema).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn validate_rejects_missing_field() {
        let schema = ResponseSchema::with_required(&["missing"]);
        let err = parse_and_validate(r#"{"present": 1}"#, &schema).unwrap_err();
        assert!(err.contains("missing"));
    }
}
