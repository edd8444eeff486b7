//! Stage runners: the collaborators that actually train and run networks.
//!
//! The orchestrator only sees the `Trainer` and `Inferencer` traits.
//! `CommandRunner` implements both by spawning a configured shell command per
//! invocation:
//! - the JSON payload `{ "config": .., "request": .. }` is written to stdin
//! - `ALTERNATE_STAGE` and an absolute `ALTERNATE_OUTPUT` are set in the
//!   environment, plus `ALTERNATE_NETWORK`, `ALTERNATE_DEVICES` and
//!   `ALTERNATE_LR_STEP` for training or `ALTERNATE_DEVICE` for inference
//! - exit code 0 is success, anything else fails the stage with stderr attached
//! - inference may print a `DetectionArtifact` as JSON on stdout; relative
//!   paths in it are read against the work dir
//! - a stage only succeeds once the checkpoint or proposal file it names exists

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::{PipelineConfig, RunnerSection};
use crate::errors::StageError;
use crate::stage::{DetectionArtifact, InferRequest, Network, TrainRequest};

/// Trains one network for one stage and returns the checkpoint it wrote.
#[async_trait]
pub trait Trainer: Send + Sync {
    async fn train(
        &self,
        config: &PipelineConfig,
        request: &TrainRequest,
    ) -> Result<Checkpoint, StageError>;
}

/// Runs a trained RPN over one partition and returns where the proposals went.
#[async_trait]
pub trait Inferencer: Send + Sync {
    async fn infer(
        &self,
        config: &PipelineConfig,
        request: &InferRequest,
    ) -> Result<DetectionArtifact, StageError>;
}

#[derive(Serialize)]
struct Payload<'a, R: Serialize> {
    config: &'a PipelineConfig,
    request: &'a R,
}

/// Default location for proposals when the inference command does not report one.
pub fn default_proposal_path(config: &PipelineConfig, request: &InferRequest) -> PathBuf {
    let source = request.checkpoint.to_string().replace('/', "_");
    config
        .root_path
        .join("cache")
        .join(format!("{}_{}_rpn.json", request.partition, source))
}

/// Runs stages as external commands from `[runner]`.
pub struct CommandRunner {
    runner: RunnerSection,
    work_dir: PathBuf,
    store: CheckpointStore,
}

impl CommandRunner {
    pub fn new(runner: RunnerSection, work_dir: impl AsRef<Path>, store: CheckpointStore) -> Self {
        Self {
            runner,
            work_dir: work_dir.as_ref().to_path_buf(),
            store,
        }
    }

    fn command_for(&self, label: &'static str) -> Result<&str, StageError> {
        let cmd = match label {
            "train-rpn" => self.runner.train_rpn.as_deref(),
            "train-rcnn" => self.runner.train_rcnn.as_deref(),
            _ => self.runner.infer_rpn.as_deref(),
        };
        cmd.filter(|c| !c.trim().is_empty())
            .ok_or(StageError::NoCommand(label))
    }

    /// `path` as seen from the work dir, made absolute.
    fn in_work_dir(&self, path: PathBuf) -> Result<PathBuf, StageError> {
        self.absolute(self.work_dir.join(path))
    }

    fn absolute(&self, path: PathBuf) -> Result<PathBuf, StageError> {
        std::path::absolute(&path)
            .with_context(|| format!("Failed to resolve {}", path.display()))
            .map_err(StageError::from)
    }

    /// Spawn `command`, feed it `payload`, and return its stdout on success.
    async fn execute(
        &self,
        label: &'static str,
        command: &str,
        payload: String,
        env: &[(&str, String)],
    ) -> Result<String, StageError> {
        debug!(stage = label, command, "spawning stage command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|source| StageError::SpawnFailed { stage: label, source })?;

        if let Some(mut stdin) = child.stdin.take() {
            // a runner that ignores its payload may close stdin early
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                debug!(stage = label, error = %e, "stage command did not read payload");
            }
        }

        let waited = if self.runner.timeout_secs > 0 {
            match timeout(
                Duration::from_secs(self.runner.timeout_secs),
                child.wait_with_output(),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    return Err(StageError::Timeout {
                        stage: label,
                        secs: self.runner.timeout_secs,
                    });
                }
            }
        } else {
            child.wait_with_output().await
        };
        let output = waited.with_context(|| format!("Failed to wait for {} command", label))?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(StageError::CommandFailed {
                stage: label,
                exit_code,
                stderr,
            });
        }
        if !stderr.is_empty() {
            debug!(stage = label, stderr = %stderr, "stage command stderr");
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Trainer for CommandRunner {
    async fn train(
        &self,
        config: &PipelineConfig,
        request: &TrainRequest,
    ) -> Result<Checkpoint, StageError> {
        let label = match request.network {
            Network::Rpn => "train-rpn",
            Network::Rcnn => "train-rcnn",
        };
        let command = self.command_for(label)?;
        let payload = serde_json::to_string(&Payload { config, request })
            .context("Failed to serialize train request")?;

        let output = request.output();
        let output_path = self.absolute(self.store.path(&output))?;
        let devices = config
            .devices
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let env = [
            ("ALTERNATE_STAGE", request.stage.to_string()),
            ("ALTERNATE_NETWORK", request.network.as_str().to_string()),
            ("ALTERNATE_DEVICES", devices),
            ("ALTERNATE_LR_STEP", request.schedule.lr_step_string()),
            ("ALTERNATE_OUTPUT", output_path.display().to_string()),
        ];

        self.execute(label, command, payload, &env).await?;

        if !output_path.is_file() {
            return Err(StageError::CheckpointNotWritten(output));
        }
        info!(stage = %request.stage, checkpoint = %output, "training finished");
        Ok(output)
    }
}

#[async_trait]
impl Inferencer for CommandRunner {
    async fn infer(
        &self,
        config: &PipelineConfig,
        request: &InferRequest,
    ) -> Result<DetectionArtifact, StageError> {
        let label = "infer-rpn";
        let command = self.command_for(label)?;
        let payload = serde_json::to_string(&Payload { config, request })
            .context("Failed to serialize infer request")?;
        let default_path = self.in_work_dir(default_proposal_path(config, request))?;
        let env = [
            ("ALTERNATE_STAGE", request.stage.to_string()),
            ("ALTERNATE_DEVICE", request.device.to_string()),
            ("ALTERNATE_OUTPUT", default_path.display().to_string()),
        ];

        let stdout = self
            .execute(label, command, payload, &env)
            .await
            .map_err(|e| StageError::Partition {
                partition: request.partition.clone(),
                message: e.to_string(),
            })?;

        let reported = stdout.trim();
        let artifact = match serde_json::from_str::<DetectionArtifact>(reported) {
            Ok(artifact) => {
                if artifact.partition != request.partition || artifact.source != request.checkpoint
                {
                    return Err(StageError::ArtifactMismatch {
                        partition: request.partition.clone(),
                        message: format!(
                            "command reported proposals for partition '{}' from {}, expected {}",
                            artifact.partition, artifact.source, request.checkpoint
                        ),
                    });
                }
                DetectionArtifact {
                    path: self.in_work_dir(artifact.path)?,
                    ..artifact
                }
            }
            Err(e) => {
                if !reported.is_empty() {
                    warn!(
                        partition = %request.partition,
                        error = %e,
                        "ignoring non-artifact output from infer command"
                    );
                }
                DetectionArtifact {
                    partition: request.partition.clone(),
                    source: request.checkpoint.clone(),
                    path: default_path,
                }
            }
        };

        if !artifact.path.is_file() {
            return Err(StageError::ArtifactNotWritten {
                partition: artifact.partition,
                path: artifact.path,
            });
        }
        debug!(partition = %artifact.partition, path = %artifact.path.display(), "proposals written");
        Ok(artifact)
    }
}
