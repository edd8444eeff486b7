pub mod pipeline;
pub mod state;

pub use pipeline::{AlternateTrainer, PipelineOutcome, describe_plan};
pub use state::{STATE_FILE_NAME, StageOutput, StageStatus, StateManager};
