pub mod context;
pub mod orchestrator;
pub mod retry;
pub mod workflow;

pub use context::{ContextSettings, DurableContext};
pub use orchestrator::{Orchestrator, OrchestratorConfig, StartOutcome};
pub use retry::{retry_transient, RetryPolicy};
pub use workflow::Workflow;
