//! Crash recovery: resume pipelines left in a non-terminal state.

use std::sync::Arc;

use console::Style;
use tokio::task::JoinHandle;

use crate::pipeline::orchestrator::PipelineOrchestrator;
use crate::runtime::StageRuntime;

/// Scan for MVPs whose status is non-terminal and restart each one as a
/// detached background task, without blocking startup. Returns one join
/// handle per resumed pipeline; zero eligible MVPs is a no-op.
pub fn resume_incomplete_pipelines<R>(
    orchestrator: Arc<PipelineOrchestrator<R>>,
) -> Vec<JoinHandle<()>>
where
    R: StageRuntime + 'static,
{
    let pending = orchestrator.store().list_non_terminal();
    if pending.is_empty() {
        eprintln!(
            "  {} no incomplete pipelines found",
            Style::new().green().apply_to("✓")
        );
        return Vec::new();
    }

    eprintln!(
        "  {} resuming {} incomplete pipeline(s)",
        Style::new().yellow().apply_to("↻"),
        pending.len()
    );

    pending
        .into_iter()
        .map(|mvp| {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                eprintln!("  resuming {} (state: {})", mvp.name, mvp.status);
                if let Err(e) = orchestrator.run(mvp.id).await {
                    eprintln!(
                        "  {} failed to resume {}: {e}",
                        Style::new().red().bold().apply_to("✗"),
                        mvp.name
                    );
                }
            })
        })
        .collect()
}
