//! Typed error hierarchy for the alternating trainer.
//!
//! Four top-level enums cover the subsystems:
//! - `ConfigError`: bad flags, unknown presets, malformed schedules
//! - `StageError`: a single stage runner invocation failed
//! - `CombineError`: checkpoint merge failures
//! - `PipelineError`: what the orchestrator surfaces to its caller

use std::path::PathBuf;

use thiserror::Error;

use crate::checkpoint::Checkpoint;
use crate::stage::Stage;

/// Errors raised while resolving configuration, before any stage runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown network '{0}'. Valid values: vgg, resnet")]
    UnknownNetwork(String),

    #[error("Unknown dataset '{0}'. Valid values: PascalVOC, coco, imagenet")]
    UnknownDataset(String),

    #[error("Invalid learning-rate step '{value}': {message}")]
    InvalidLrStep { value: String, message: String },

    #[error("Invalid device list '{0}': expected comma-separated device indices")]
    InvalidDevices(String),

    #[error("Invalid work load list '{0}': expected comma-separated numbers")]
    InvalidWorkLoad(String),

    #[error("Image set is empty")]
    EmptyImageSet,

    #[error("Invalid checkpoint reference '{0}': expected <prefix>:<epoch>")]
    InvalidCheckpointRef(String),

    #[error("Failed to read config file at {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {message}")]
    FileParse { path: PathBuf, message: String },
}

/// Errors from a single stage runner invocation.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("No command configured for {0}")]
    NoCommand(&'static str),

    #[error("Failed to spawn {stage} command: {source}")]
    SpawnFailed {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} command exited with code {exit_code}: {stderr}")]
    CommandFailed {
        stage: &'static str,
        exit_code: i32,
        stderr: String,
    },

    #[error("{stage} command timed out after {secs} seconds")]
    Timeout { stage: &'static str, secs: u64 },

    #[error("Inference on partition '{partition}' failed: {message}")]
    Partition { partition: String, message: String },

    #[error("Expected checkpoint {0} was not written")]
    CheckpointNotWritten(Checkpoint),

    #[error("Proposals for partition '{partition}' were not written to {}", path.display())]
    ArtifactNotWritten { partition: String, path: PathBuf },

    #[error("Inference on partition '{partition}' returned the wrong artifact: {message}")]
    ArtifactMismatch { partition: String, message: String },

    #[error("No devices configured for inference")]
    NoDevices,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from merging two checkpoints.
#[derive(Debug, Error)]
pub enum CombineError {
    #[error("Checkpoint {checkpoint} not found at {}", path.display())]
    MissingCheckpoint { checkpoint: Checkpoint, path: PathBuf },

    #[error("Failed to load checkpoint {checkpoint}: {message}")]
    Unreadable {
        checkpoint: Checkpoint,
        message: String,
    },

    #[error("Checkpoints {first} and {second} share no {section} layers")]
    NoSharedLayers {
        first: Checkpoint,
        second: Checkpoint,
        section: &'static str,
    },

    #[error(
        "Layer '{layer}' has shape {first_shape:?} in {first} but {second_shape:?} in {second}"
    )]
    ShapeMismatch {
        layer: String,
        first: Checkpoint,
        first_shape: Vec<usize>,
        second: Checkpoint,
        second_shape: Vec<usize>,
    },

    #[error("Combining into {checkpoint} did not finish: {message}")]
    Aborted {
        checkpoint: Checkpoint,
        message: String,
    },

    #[error("Failed to write combined checkpoint {checkpoint}: {source}")]
    WriteFailed {
        checkpoint: Checkpoint,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors surfaced by the orchestrator. Every variant aborts the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Stage {stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageError,
    },

    #[error("Stage {stage} failed: {source}")]
    Combine {
        stage: Stage,
        #[source]
        source: CombineError,
    },

    #[error("Failed to record state for stage {stage}: {source}")]
    State {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// The stage the pipeline stopped at.
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Stage { stage, .. }
            | PipelineError::Combine { stage, .. }
            | PipelineError::State { stage, .. } => *stage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_lr_step_carries_value() {
        let err = ConfigError::InvalidLrStep {
            value: "6,x".into(),
            message: "not a number".into(),
        };
        assert!(err.to_string().contains("6,x"));
    }

    #[test]
    fn combine_error_names_layer_and_checkpoints() {
        let err = CombineError::ShapeMismatch {
            layer: "conv1_weight".into(),
            first: Checkpoint::new("model/rpn2", 8),
            first_shape: vec![64, 3, 3, 3],
            second: Checkpoint::new("model/rcnn1", 8),
            second_shape: vec![32, 3, 3, 3],
        };
        let msg = err.to_string();
        assert!(msg.contains("conv1_weight"));
        assert!(msg.contains("model/rpn2-0008"));
        assert!(msg.contains("model/rcnn1-0008"));
    }

    #[test]
    fn pipeline_error_reports_stage() {
        let err = PipelineError::Stage {
            stage: Stage::InferRpn1,
            source: StageError::NoCommand("infer-rpn"),
        };
        assert_eq!(err.stage(), Stage::InferRpn1);
        assert!(err.to_string().contains("infer-rpn"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ConfigError::EmptyImageSet);
        assert_std_error(&StageError::NoCommand("train-rpn"));
        assert_std_error(&CombineError::NoSharedLayers {
            first: Checkpoint::new("a", 0),
            second: Checkpoint::new("b", 0),
            section: "arg",
        });
    }
}
