//! Epoch ranges and learning-rate schedules attached to training stages.

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Half-open training window `[begin, end)` in epochs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRange {
    pub begin: u32,
    pub end: u32,
}

impl EpochRange {
    /// Every lineage in the alternating schedule restarts counting at zero.
    pub fn from_zero(end: u32) -> Self {
        Self { begin: 0, end }
    }
}

/// Base learning rate plus the epochs at which it decays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrSchedule {
    pub base_lr: f64,
    pub lr_step: Vec<u32>,
}

impl LrSchedule {
    pub fn new(base_lr: f64, lr_step: Vec<u32>) -> Self {
        Self { base_lr, lr_step }
    }

    /// Build a schedule from a comma-separated step string such as `"6"` or `"4,6"`.
    pub fn parse(base_lr: f64, lr_step: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(base_lr, parse_lr_step(lr_step)?))
    }

    /// The step string as passed to the trainer.
    pub fn lr_step_string(&self) -> String {
        self.lr_step
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Parse a comma-separated, non-decreasing list of epochs.
pub fn parse_lr_step(value: &str) -> Result<Vec<u32>, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidLrStep {
        value: value.to_string(),
        message,
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let mut steps = Vec::new();
    for part in trimmed.split(',') {
        let part = part.trim();
        let epoch: u32 = part
            .parse()
            .map_err(|_| invalid(format!("'{}' is not an epoch number", part)))?;
        if let Some(&last) = steps.last()
            && epoch < last
        {
            return Err(invalid(format!("step {} comes after {}", epoch, last)));
        }
        steps.push(epoch);
    }
    Ok(steps)
}
