use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use crate::checkpoint::Checkpoint;
use crate::stage::{DetectionArtifact, Stage};

pub const STATE_FILE_NAME: &str = "pipeline.state";

/// Lifecycle of a single stage within one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a completed stage produced, kept so a later run can skip it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageOutput {
    Checkpoint { checkpoint: Checkpoint },
    Detections { artifacts: Vec<DetectionArtifact> },
}

impl StageOutput {
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        match self {
            StageOutput::Checkpoint { checkpoint } => Some(checkpoint),
            StageOutput::Detections { .. } => None,
        }
    }

    pub fn artifacts(&self) -> Option<&[DetectionArtifact]> {
        match self {
            StageOutput::Detections { artifacts } => Some(artifacts),
            StageOutput::Checkpoint { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StageOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Fingerprint of the pipeline config the stage ran with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Append-only JSON-lines log of stage transitions.
pub struct StateManager {
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf) -> Self {
        Self { state_file }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.state_file
    }

    pub fn save(
        &self,
        stage: Stage,
        status: StageStatus,
        output: Option<StageOutput>,
        error: Option<String>,
        fingerprint: Option<&str>,
    ) -> Result<()> {
        let entry = StateEntry {
            stage,
            status,
            output,
            error,
            fingerprint: fingerprint.map(str::to_string),
            timestamp: Utc::now(),
        };
        let mut line = serde_json::to_string(&entry).context("Failed to serialize state entry")?;
        line.push('\n');

        if let Some(parent) = self.state_file.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.state_file)
            .context("Failed to open state file")?
            .write_all(line.as_bytes())
            .context("Failed to write state entry")?;

        Ok(())
    }

    /// All entries in write order. Lines that fail to parse are skipped.
    pub fn get_entries(&self) -> Result<Vec<StateEntry>> {
        if !self.state_file.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.state_file).context("Failed to read state file")?;

        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// Latest status of `stage`; `Pending` if it never ran.
    pub fn status(&self, stage: Stage) -> Result<StageStatus> {
        Ok(self
            .get_entries()?
            .into_iter()
            .rfind(|e| e.stage == stage)
            .map(|e| e.status)
            .unwrap_or_default())
    }

    /// Output of `stage` if its latest entry is a completion. With a
    /// `fingerprint`, the completion must have been recorded under the same one.
    pub fn completed_output(
        &self,
        stage: Stage,
        fingerprint: Option<&str>,
    ) -> Result<Option<StageOutput>> {
        Ok(self
            .get_entries()?
            .into_iter()
            .rfind(|e| e.stage == stage)
            .filter(|e| e.status == StageStatus::Completed)
            .filter(|e| fingerprint.is_none() || e.fingerprint.as_deref() == fingerprint)
            .and_then(|e| e.output))
    }

    /// Latest entry per stage, in pipeline order. Stages never run are absent.
    pub fn summary(&self) -> Result<Vec<(Stage, Option<StateEntry>)>> {
        let entries = self.get_entries()?;
        Ok(Stage::all()
            .iter()
            .map(|stage| {
                let latest = entries.iter().rfind(|e| e.stage == *stage).cloned();
                (*stage, latest)
            })
            .collect())
    }

    pub fn reset(&self) -> Result<()> {
        if self.state_file.exists() {
            fs::remove_file(&self.state_file).context("Failed to remove state file")?;
        }
        Ok(())
    }
}
