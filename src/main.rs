mod anthropic;
mod cli;
mod config;
mod error;
mod guardrails;
mod metrics;
mod pipeline;
mod router;
mod runtime;
mod state_machine;
mod store;
mod ui;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use console::Style;

use anthropic::AnthropicClient;
use cli::{Cli, Command};
use config::ForgeConfig;
use guardrails::{CostAlerter, Guardrails};
use metrics::{InMemoryMetrics, MetricsSink};
use pipeline::{PipelineOrchestrator, STAGES, StageExecutor, resume_incomplete_pipelines};
use router::{LlmRouter, UsageLedger};
use runtime::LlmStageRuntime;
use store::MvpStore;
use ui::PipelineProgress;

/// Emits cost alerts as styled stderr warnings.
struct LogAlerter;

impl CostAlerter for LogAlerter {
    fn alert(&self, current_cost: f64, threshold: f64) {
        eprintln!(
            "  {} cost alert: ${current_cost:.2} exceeded threshold ${threshold:.2}",
            Style::new().yellow().bold().apply_to("⚠")
        );
    }
}

type ForgeRuntime = LlmStageRuntime<AnthropicClient>;
type ForgeOrchestrator = PipelineOrchestrator<ForgeRuntime>;

fn build_pipeline(
    config: &ForgeConfig,
    store: Arc<MvpStore>,
    metrics: Arc<InMemoryMetrics>,
) -> (Arc<ForgeOrchestrator>, Arc<ForgeRuntime>) {
    let ledger = Arc::new(UsageLedger::new());
    let client = AnthropicClient::new(config.api_key.clone());
    let router = LlmRouter::new(client, config.models.clone(), config.max_llm_retries, ledger);
    let runtime = Arc::new(LlmStageRuntime::new(
        router,
        Arc::clone(&store),
        Duration::from_millis(config.stage_delay_ms),
        config.models.fallbacks.clone(),
    ));
    let guardrails = Arc::new(
        Guardrails::new(
            Duration::from_secs(config.max_total_runtime_secs),
            config.alert_cost_threshold,
        )
        .with_alerter(Arc::new(LogAlerter)),
    );
    let executor = StageExecutor::new(
        Arc::clone(&store),
        Arc::clone(&runtime),
        guardrails,
        metrics.clone() as Arc<dyn MetricsSink>,
    );
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        store,
        executor,
        metrics as Arc<dyn MetricsSink>,
        config.max_agent_retries,
    ));
    (orchestrator, runtime)
}

#[tokio::main]
async fn main() -> Result<()> {
    state_machine::validate_table_integrity().map_err(|e| anyhow::anyhow!(e))?;

    let cli = Cli::parse();
    let mut config = ForgeConfig::load()?;
    if let Some(max_retries) = cli.max_retries {
        config.max_agent_retries = max_retries;
    }
    if let Some(max_cost) = cli.max_cost {
        config.max_mvp_cost = max_cost;
    }

    match cli.command {
        Command::Run { name, summary } => run_pipeline(&config, &name, summary).await,
        Command::Status => {
            print_status(&config);
            Ok(())
        }
        Command::Resume => resume(&config).await,
    }
}

async fn run_pipeline(config: &ForgeConfig, name: &str, summary: Option<String>) -> Result<()> {
    let store = Arc::new(MvpStore::new());
    let metrics = Arc::new(InMemoryMetrics::new());
    let (orchestrator, runtime) = build_pipeline(config, Arc::clone(&store), Arc::clone(&metrics));

    let mvp = store.create_mvp(name, summary)?;
    let max_cost = config.max_mvp_cost;
    store.update(mvp.id, |m| m.max_allowed_cost = max_cost)?;

    // Admission guard: one active pipeline per MVP id.
    store.check_pipeline_conflict(mvp.id)?;

    let progress = PipelineProgress::start(&mvp.name);
    let result = orchestrator.run(mvp.id).await;

    let record = store.get(mvp.id)?;
    progress.complete(&record);
    progress.print_attempts(&store.attempts_for(mvp.id));
    progress.print_record(&record);

    let stats = runtime.router().get_usage_stats();
    println!(
        "  session usage: {} tokens, ${:.4}",
        stats.total_tokens_used, stats.total_cost
    );
    println!(
        "  stages: {} completed, {} failed",
        metrics.stage_completions(),
        metrics.stage_failures()
    );

    if let Err(e) = &result {
        eprintln!(
            "  {} {e} [{} {}]",
            Style::new().red().bold().apply_to("✗"),
            e.code(),
            e.http_status()
        );
    }
    result.map_err(Into::into)
}

fn print_status(config: &ForgeConfig) {
    println!("mvpforge configuration");
    println!("  max cost per MVP:   ${:.2}", config.max_mvp_cost);
    println!("  alert threshold:    ${:.2}", config.alert_cost_threshold);
    println!("  runtime ceiling:    {}s", config.max_total_runtime_secs);
    println!("  pipeline retries:   {}", config.max_agent_retries);
    println!();
    println!("stage sequence");
    for spec in STAGES {
        println!("  {:<14} -> {}", spec.name, spec.target);
    }
}

async fn resume(config: &ForgeConfig) -> Result<()> {
    let store = Arc::new(MvpStore::new());
    let metrics = Arc::new(InMemoryMetrics::new());
    let (orchestrator, _runtime) = build_pipeline(config, store, metrics);

    let handles = resume_incomplete_pipelines(orchestrator);
    let resumed = handles.len();
    for handle in handles {
        let _ = handle.await;
    }
    if resumed > 0 {
        println!("resumed {resumed} pipeline(s)");
    }
    Ok(())
}
