mod executor;
mod orchestrator;
mod recovery;

pub use executor::StageExecutor;
pub use orchestrator::{PipelineOrchestrator, STAGES, StageSpec};
pub use recovery::resume_incomplete_pipelines;
