//! The fixed stage graph of alternating training and the requests each stage
//! hands to its runner.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::schedule::{EpochRange, LrSchedule};

/// One step of the alternating schedule, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Train RPN from the pretrained classifier
    TrainRpn1,
    /// Generate proposals with rpn1 for every partition
    InferRpn1,
    /// Train RCNN from the pretrained classifier on rpn1 proposals
    TrainRcnn1,
    /// Train RPN seeded from rcnn1 with the backbone frozen
    TrainRpn2,
    /// Generate proposals with rpn2 for every partition
    InferRpn2,
    /// Merge rpn2 and rcnn1 into the rcnn2 seed
    CombineRcnn2,
    /// Train RCNN seeded from rcnn2 on rpn2 proposals with the backbone frozen
    TrainRcnn2,
    /// Merge rpn2 and rcnn2 into the final model
    CombineFinal,
}

impl Stage {
    pub fn all() -> &'static [Stage] {
        &[
            Stage::TrainRpn1,
            Stage::InferRpn1,
            Stage::TrainRcnn1,
            Stage::TrainRpn2,
            Stage::InferRpn2,
            Stage::CombineRcnn2,
            Stage::TrainRcnn2,
            Stage::CombineFinal,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::TrainRpn1 => "train_rpn1",
            Stage::InferRpn1 => "infer_rpn1",
            Stage::TrainRcnn1 => "train_rcnn1",
            Stage::TrainRpn2 => "train_rpn2",
            Stage::InferRpn2 => "infer_rpn2",
            Stage::CombineRcnn2 => "combine_rcnn2",
            Stage::TrainRcnn2 => "train_rcnn2",
            Stage::CombineFinal => "combine_final",
        }
    }

    /// 1-based position in the schedule.
    pub fn number(&self) -> usize {
        Stage::all()
            .iter()
            .position(|s| s == self)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// Banner logged when the stage starts.
    pub fn title(&self) -> &'static str {
        match self {
            Stage::TrainRpn1 => "TRAIN RPN WITH IMAGENET INIT",
            Stage::InferRpn1 | Stage::InferRpn2 => "GENERATE RPN DETECTION",
            Stage::TrainRcnn1 => "TRAIN RCNN WITH IMAGENET INIT AND RPN DETECTION",
            Stage::TrainRpn2 => "TRAIN RPN WITH RCNN INIT",
            Stage::CombineRcnn2 => "COMBINE RPN2 WITH RCNN1",
            Stage::TrainRcnn2 => "TRAIN RCNN WITH RPN INIT AND DETECTION",
            Stage::CombineFinal => "COMBINE RPN2 WITH RCNN2",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::all()
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s.to_lowercase())
            .ok_or_else(|| anyhow::anyhow!("Unknown stage '{}'", s))
    }
}

/// Which of the two detector networks a training stage updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Rpn,
    Rcnn,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Rpn => "rpn",
            Network::Rcnn => "rcnn",
        }
    }
}

/// Proposals produced by one inference run over one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionArtifact {
    pub partition: String,
    /// RPN checkpoint that produced the proposals
    pub source: Checkpoint,
    pub path: PathBuf,
}

/// Everything a trainer needs for one training stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainRequest {
    pub stage: Stage,
    pub network: Network,
    /// Weights the run starts from
    pub seed: Checkpoint,
    /// Lineage the run writes to; the result is `output_prefix` at `epochs.end`
    pub output_prefix: String,
    pub epochs: EpochRange,
    pub schedule: LrSchedule,
    /// Hold the backbone fixed and adapt only the head layers
    pub shared: bool,
    /// Proposal files for RCNN training; empty for RPN stages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proposals: Vec<DetectionArtifact>,
}

impl TrainRequest {
    pub fn output(&self) -> Checkpoint {
        Checkpoint::new(self.output_prefix.clone(), self.epochs.end)
    }
}

/// One partition of one inference stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferRequest {
    pub stage: Stage,
    pub checkpoint: Checkpoint,
    pub partition: String,
    pub device: usize,
    /// Minimum proposal score kept; 0 keeps everything
    pub thresh: f64,
    pub shuffle: bool,
    pub vis: bool,
}

impl InferRequest {
    pub fn proposals(stage: Stage, checkpoint: Checkpoint, partition: &str, device: usize) -> Self {
        Self {
            stage,
            checkpoint,
            partition: partition.to_string(),
            device,
            thresh: 0.0,
            shuffle: false,
            vis: false,
        }
    }
}
