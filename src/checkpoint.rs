//! Checkpoint identity and the on-disk parameter format.
//!
//! A checkpoint is addressed by `(prefix, epoch)` and lives at
//! `<root>/<prefix>-<epoch:04>.params.json`. Files are written once through a
//! temporary sibling and renamed into place, so readers never observe a
//! partially written checkpoint.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Identity of a persisted set of network weights.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    pub prefix: String,
    pub epoch: u32,
}

impl Checkpoint {
    pub fn new(prefix: impl Into<String>, epoch: u32) -> Self {
        Self {
            prefix: prefix.into(),
            epoch,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.params.json", self)
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:04}", self.prefix, self.epoch)
    }
}

/// Parses `<prefix>:<epoch>`, as used on the command line.
impl FromStr for Checkpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, epoch) = s
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidCheckpointRef(s.to_string()))?;
        let epoch = epoch
            .parse()
            .map_err(|_| ConfigError::InvalidCheckpointRef(s.to_string()))?;
        if prefix.is_empty() {
            return Err(ConfigError::InvalidCheckpointRef(s.to_string()));
        }
        Ok(Self::new(prefix, epoch))
    }
}

/// A named dense array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Contents of a checkpoint file: trainable arguments and auxiliary states.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamsFile {
    #[serde(default)]
    pub arg_params: BTreeMap<String, Tensor>,
    #[serde(default)]
    pub aux_params: BTreeMap<String, Tensor>,
}

impl ParamsFile {
    /// Check every tensor's data length against its shape.
    pub fn validate(&self) -> Result<()> {
        for (section, params) in [("arg", &self.arg_params), ("aux", &self.aux_params)] {
            for (name, tensor) in params {
                if tensor.element_count() != tensor.data.len() {
                    anyhow::bail!(
                        "{} param '{}' has shape {:?} but {} values",
                        section,
                        name,
                        tensor.shape,
                        tensor.data.len()
                    );
                }
            }
        }
        Ok(())
    }
}

/// Resolves checkpoint identities to files under a root directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self, checkpoint: &Checkpoint) -> PathBuf {
        self.root.join(checkpoint.file_name())
    }

    pub fn exists(&self, checkpoint: &Checkpoint) -> bool {
        self.path(checkpoint).is_file()
    }

    pub fn load(&self, checkpoint: &Checkpoint) -> Result<ParamsFile> {
        let path = self.path(checkpoint);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
        let params: ParamsFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse checkpoint: {}", path.display()))?;
        params
            .validate()
            .with_context(|| format!("Corrupt checkpoint: {}", path.display()))?;
        Ok(params)
    }

    pub fn save(&self, checkpoint: &Checkpoint, params: &ParamsFile) -> Result<PathBuf> {
        let path = self.path(checkpoint);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content =
            serde_json::to_string_pretty(params).context("Failed to serialize checkpoint")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write checkpoint: {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move checkpoint into {}", path.display()))?;
        Ok(path)
    }
}
