pub mod analysis;
pub mod merge;
pub mod polling;

pub use analysis::{
    AnalysisInput, AnalysisOrchestrator, AnalysisOutput, AnalysisSettings, AnalysisWorkflow,
    WORKFLOW_NAME,
};
pub use merge::flatten_lines;
pub use polling::PollPolicy;
