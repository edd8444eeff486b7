//! Pipeline configuration.
//!
//! Settings come from three layers, later ones winning:
//! - `alternate.toml` in the work directory (runner commands, paths)
//! - environment variables (`ALTERNATE_*_CMD`)
//! - command-line flags, falling back to network/dataset presets
//!
//! The result is a `PipelineConfig` built once before the first stage and
//! shared by reference with every stage call; nothing mutates it afterwards.
//!
//! # Configuration File Format
//!
//! ```toml
//! [runner]
//! train_rpn = "python -m rcnn.tools.train_rpn"
//! train_rcnn = "python -m rcnn.tools.train_rcnn"
//! infer_rpn = "python -m rcnn.tools.test_rpn"
//! timeout_secs = 0
//!
//! [paths]
//! model_prefix = "model"
//! state_dir = ".alternate"
//!
//! [inference]
//! max_parallel = 1
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::checkpoint::Checkpoint;
use crate::errors::ConfigError;
use crate::presets;
use crate::schedule::LrSchedule;

pub const CONFIG_FILE_NAME: &str = "alternate.toml";

const DEFAULT_FREQUENT: u32 = 20;
const DEFAULT_KVSTORE: &str = "device";
const DEFAULT_GPUS: &str = "0";

/// External commands that run the stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerSection {
    #[serde(default)]
    pub train_rpn: Option<String>,
    #[serde(default)]
    pub train_rcnn: Option<String>,
    #[serde(default)]
    pub infer_rpn: Option<String>,
    /// Per-invocation timeout; 0 waits indefinitely
    #[serde(default)]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsSection {
    /// Directory prefix every lineage name lives under
    #[serde(default = "default_model_prefix")]
    pub model_prefix: String,
    /// Where the stage state log is kept
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_model_prefix() -> String {
    "model".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".alternate")
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            model_prefix: default_model_prefix(),
            state_dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceSection {
    /// Upper bound on partitions inferred at once (also capped by device count)
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

fn default_max_parallel() -> usize {
    1
}

impl Default for InferenceSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
        }
    }
}

/// Contents of `alternate.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlternateToml {
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub inference: InferenceSection,
}

impl AlternateToml {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|message| ConfigError::FileParse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Load `alternate.toml` from `work_dir`, or defaults when absent.
    pub fn load_or_default(work_dir: &Path) -> Result<Self, ConfigError> {
        let path = work_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `ALTERNATE_TRAIN_RPN_CMD`, `ALTERNATE_TRAIN_RCNN_CMD` and
    /// `ALTERNATE_INFER_RPN_CMD` on top of the file values.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(cmd) = lookup("ALTERNATE_TRAIN_RPN_CMD") {
            self.runner.train_rpn = Some(cmd);
        }
        if let Some(cmd) = lookup("ALTERNATE_TRAIN_RCNN_CMD") {
            self.runner.train_rcnn = Some(cmd);
        }
        if let Some(cmd) = lookup("ALTERNATE_INFER_RPN_CMD") {
            self.runner.infer_rpn = Some(cmd);
        }
        self
    }

    /// Human-readable warnings about settings that will fail later.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for (key, cmd) in [
            ("runner.train_rpn", &self.runner.train_rpn),
            ("runner.train_rcnn", &self.runner.train_rcnn),
            ("runner.infer_rpn", &self.runner.infer_rpn),
        ] {
            match cmd {
                None => warnings.push(format!("{} is not set; the pipeline cannot run", key)),
                Some(c) if c.trim().is_empty() => warnings.push(format!("{} is empty", key)),
                _ => {}
            }
        }
        if self.inference.max_parallel == 0 {
            warnings.push("inference.max_parallel is 0; treating it as 1".to_string());
        }
        if self.paths.model_prefix.trim().is_empty() {
            warnings.push("paths.model_prefix is empty".to_string());
        }
        warnings
    }
}

/// Raw flag values before presets are applied. `None` means "use the preset".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub network: Option<String>,
    pub dataset: Option<String>,
    pub image_set: Option<String>,
    pub root_path: Option<PathBuf>,
    pub dataset_path: Option<PathBuf>,
    pub frequent: Option<u32>,
    pub kvstore: Option<String>,
    pub work_load_list: Option<String>,
    pub no_flip: bool,
    pub no_shuffle: bool,
    pub resume: bool,
    pub gpus: Option<String>,
    pub pretrained: Option<String>,
    pub pretrained_epoch: Option<u32>,
    pub rpn_epoch: Option<u32>,
    pub rpn_lr: Option<f64>,
    pub rpn_lr_step: Option<String>,
    pub rcnn_epoch: Option<u32>,
    pub rcnn_lr: Option<f64>,
    pub rcnn_lr_step: Option<String>,
    pub use_global_context: bool,
    pub use_data_augmentation: bool,
    pub use_roi_align: bool,
}

/// Training-config overrides applied to every stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainOverrides {
    /// Lower IoU bound for background RoIs
    pub bg_thresh_lo: f64,
}

impl TrainOverrides {
    /// Alternating training samples background RoIs from IoU 0 upward.
    pub fn alternate() -> Self {
        Self { bg_thresh_lo: 0.0 }
    }
}

/// End epoch and learning-rate schedule for one network family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSchedule {
    pub end_epoch: u32,
    pub lr: LrSchedule,
}

/// Names of the checkpoint lineages the pipeline produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lineages {
    pub rpn1: String,
    pub rcnn1: String,
    pub rpn2: String,
    pub rcnn2: String,
    pub final_model: String,
}

impl Lineages {
    pub fn under(prefix: &str) -> Self {
        let name = |n: &str| {
            if prefix.is_empty() {
                n.to_string()
            } else {
                format!("{}/{}", prefix.trim_end_matches('/'), n)
            }
        };
        Self {
            rpn1: name("rpn1"),
            rcnn1: name("rcnn1"),
            rpn2: name("rpn2"),
            rcnn2: name("rcnn2"),
            final_model: name("final"),
        }
    }
}

/// Fully resolved, immutable settings for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub network: String,
    pub dataset: String,
    pub num_classes: usize,
    /// Image-set partitions, in the order given on the command line
    pub image_sets: Vec<String>,
    pub root_path: PathBuf,
    pub dataset_path: PathBuf,
    pub frequent: u32,
    pub kvstore: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_load_list: Option<Vec<f64>>,
    pub flip: bool,
    pub shuffle: bool,
    pub resume: bool,
    pub devices: Vec<usize>,
    pub pretrained: Checkpoint,
    pub rpn: StageSchedule,
    pub rcnn: StageSchedule,
    pub use_global_context: bool,
    pub use_data_augmentation: bool,
    pub use_roi_align: bool,
    pub overrides: TrainOverrides,
    pub lineages: Lineages,
}

impl PipelineConfig {
    /// Resolve flags against presets. All configuration errors surface here.
    pub fn resolve(cli: &CliOverrides, file: &AlternateToml) -> Result<Self, ConfigError> {
        let network = presets::network(cli.network.as_deref().unwrap_or(presets::DEFAULT_NETWORK))?;
        let dataset = presets::dataset(cli.dataset.as_deref().unwrap_or(presets::DEFAULT_DATASET))?;

        let image_sets = parse_image_sets(cli.image_set.as_deref().unwrap_or(dataset.image_set))?;
        let devices = parse_devices(cli.gpus.as_deref().unwrap_or(DEFAULT_GPUS))?;
        let work_load_list = cli
            .work_load_list
            .as_deref()
            .map(parse_work_load)
            .transpose()?;

        let rpn = StageSchedule {
            end_epoch: cli.rpn_epoch.unwrap_or(dataset.rpn_epoch),
            lr: LrSchedule::parse(
                cli.rpn_lr.unwrap_or(network.rpn_lr),
                cli.rpn_lr_step.as_deref().unwrap_or(dataset.rpn_lr_step),
            )?,
        };
        let rcnn = StageSchedule {
            end_epoch: cli.rcnn_epoch.unwrap_or(dataset.rcnn_epoch),
            lr: LrSchedule::parse(
                cli.rcnn_lr.unwrap_or(network.rcnn_lr),
                cli.rcnn_lr_step.as_deref().unwrap_or(dataset.rcnn_lr_step),
            )?,
        };

        Ok(Self {
            network: network.name.to_string(),
            dataset: dataset.name.to_string(),
            num_classes: dataset.num_classes,
            image_sets,
            root_path: cli
                .root_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(dataset.root_path)),
            dataset_path: cli
                .dataset_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(dataset.dataset_path)),
            frequent: cli.frequent.unwrap_or(DEFAULT_FREQUENT),
            kvstore: cli
                .kvstore
                .clone()
                .unwrap_or_else(|| DEFAULT_KVSTORE.to_string()),
            work_load_list,
            flip: !cli.no_flip,
            shuffle: !cli.no_shuffle,
            resume: cli.resume,
            devices,
            pretrained: Checkpoint::new(
                cli.pretrained
                    .clone()
                    .unwrap_or_else(|| network.pretrained.to_string()),
                cli.pretrained_epoch.unwrap_or(network.pretrained_epoch),
            ),
            rpn,
            rcnn,
            use_global_context: cli.use_global_context,
            use_data_augmentation: cli.use_data_augmentation,
            use_roi_align: cli.use_roi_align,
            overrides: TrainOverrides::alternate(),
            lineages: Lineages::under(&file.paths.model_prefix),
        })
    }

    /// The `+`-joined image set as trainers expect it.
    pub fn image_set(&self) -> String {
        self.image_sets.join("+")
    }

    /// Short SHA256 of the resolved settings. Recorded stage outputs are only
    /// reused by a run whose fingerprint matches.
    pub fn fingerprint(&self) -> anyhow::Result<String> {
        let bytes = serde_json::to_vec(self).context("Failed to serialize pipeline config")?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize())[..16].to_string())
    }
}

/// Split a `+`-delimited image set into partitions.
pub fn parse_image_sets(value: &str) -> Result<Vec<String>, ConfigError> {
    let sets: Vec<String> = value
        .split('+')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if sets.is_empty() {
        return Err(ConfigError::EmptyImageSet);
    }
    Ok(sets)
}

/// Parse `--gpus`, e.g. `"0,1,2"`.
pub fn parse_devices(value: &str) -> Result<Vec<usize>, ConfigError> {
    let devices = value
        .split(',')
        .map(|d| d.trim().parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ConfigError::InvalidDevices(value.to_string()))?;
    if devices.is_empty() {
        return Err(ConfigError::InvalidDevices(value.to_string()));
    }
    Ok(devices)
}

/// Parse `--work-load-list`, e.g. `"1,1,2"`.
pub fn parse_work_load(value: &str) -> Result<Vec<f64>, ConfigError> {
    value
        .split(',')
        .map(|w| w.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ConfigError::InvalidWorkLoad(value.to_string()))
}
