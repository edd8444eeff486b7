//! The alternating training sequence.
//!
//! Eight stages run strictly one after another; each consumes the checkpoints
//! and proposal artifacts returned by earlier stages. Any failure aborts the
//! run and leaves already written checkpoints in place.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, error, info, warn};

use crate::checkpoint::Checkpoint;
use crate::combine::ModelCombiner;
use crate::config::{PipelineConfig, StageSchedule};
use crate::errors::{CombineError, PipelineError, StageError};
use crate::runner::{Inferencer, Trainer};
use crate::schedule::EpochRange;
use crate::stage::{DetectionArtifact, InferRequest, Network, Stage, TrainRequest};

use super::state::{StageOutput, StageStatus, StateManager};

/// Every checkpoint and artifact set the pipeline produced.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub rpn1: Checkpoint,
    pub rpn1_detections: Vec<DetectionArtifact>,
    pub rcnn1: Checkpoint,
    pub rpn2: Checkpoint,
    pub rpn2_detections: Vec<DetectionArtifact>,
    pub rcnn2_seed: Checkpoint,
    pub rcnn2: Checkpoint,
    pub final_model: Checkpoint,
    /// Stages reused from a previous run instead of executed
    pub skipped: Vec<Stage>,
}

/// Per-run bookkeeping shared by every stage.
struct RunLog {
    fingerprint: String,
    skipped: Vec<Stage>,
}

/// Sequences training, inference and combination into the alternating schedule.
pub struct AlternateTrainer {
    trainer: Arc<dyn Trainer>,
    inferencer: Arc<dyn Inferencer>,
    combiner: Arc<dyn ModelCombiner>,
    state: Option<StateManager>,
    skip_completed: bool,
    max_parallel: usize,
}

impl AlternateTrainer {
    pub fn new(
        trainer: Arc<dyn Trainer>,
        inferencer: Arc<dyn Inferencer>,
        combiner: Arc<dyn ModelCombiner>,
    ) -> Self {
        Self {
            trainer,
            inferencer,
            combiner,
            state: None,
            skip_completed: false,
            max_parallel: 1,
        }
    }

    /// Record stage transitions to `state`. With `skip_completed`, stages whose
    /// latest entry is a completion under the same config fingerprint are not
    /// run again.
    pub fn with_state(mut self, state: StateManager, skip_completed: bool) -> Self {
        self.state = Some(state);
        self.skip_completed = skip_completed;
        self
    }

    /// Upper bound on partitions inferred concurrently within one stage.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub async fn run(&self, config: &PipelineConfig) -> Result<PipelineOutcome, PipelineError> {
        let names = &config.lineages;
        let mut run = RunLog {
            fingerprint: config
                .fingerprint()
                .map_err(|source| PipelineError::State {
                    stage: Stage::TrainRpn1,
                    source,
                })?,
            skipped: Vec::new(),
        };

        let rpn1 = self
            .stage(Stage::TrainRpn1, &mut run, async {
                let request = train_request(
                    Stage::TrainRpn1,
                    Network::Rpn,
                    config.pretrained.clone(),
                    &names.rpn1,
                    &config.rpn,
                    false,
                    Vec::new(),
                );
                self.train(config, request).await
            })
            .await?;
        let rpn1 = expect_checkpoint(Stage::TrainRpn1, rpn1)?;

        let rpn1_detections = self
            .stage(Stage::InferRpn1, &mut run, async {
                self.infer_partitions(config, Stage::InferRpn1, &rpn1).await
            })
            .await?;
        let rpn1_detections = expect_artifacts(Stage::InferRpn1, rpn1_detections)?;

        let rcnn1 = self
            .stage(Stage::TrainRcnn1, &mut run, async {
                let request = train_request(
                    Stage::TrainRcnn1,
                    Network::Rcnn,
                    config.pretrained.clone(),
                    &names.rcnn1,
                    &config.rcnn,
                    false,
                    rpn1_detections.clone(),
                );
                self.train(config, request).await
            })
            .await?;
        let rcnn1 = expect_checkpoint(Stage::TrainRcnn1, rcnn1)?;

        let rpn2 = self
            .stage(Stage::TrainRpn2, &mut run, async {
                let request = train_request(
                    Stage::TrainRpn2,
                    Network::Rpn,
                    rcnn1.clone(),
                    &names.rpn2,
                    &config.rpn,
                    true,
                    Vec::new(),
                );
                self.train(config, request).await
            })
            .await?;
        let rpn2 = expect_checkpoint(Stage::TrainRpn2, rpn2)?;

        let rpn2_detections = self
            .stage(Stage::InferRpn2, &mut run, async {
                self.infer_partitions(config, Stage::InferRpn2, &rpn2).await
            })
            .await?;
        let rpn2_detections = expect_artifacts(Stage::InferRpn2, rpn2_detections)?;

        let rcnn2_seed = self
            .stage(Stage::CombineRcnn2, &mut run, async {
                self.combine(
                    Stage::CombineRcnn2,
                    &rpn2,
                    &rcnn1,
                    Checkpoint::new(names.rcnn2.clone(), 0),
                )
                .await
            })
            .await?;
        let rcnn2_seed = expect_checkpoint(Stage::CombineRcnn2, rcnn2_seed)?;

        let rcnn2 = self
            .stage(Stage::TrainRcnn2, &mut run, async {
                let request = train_request(
                    Stage::TrainRcnn2,
                    Network::Rcnn,
                    rcnn2_seed.clone(),
                    &names.rcnn2,
                    &config.rcnn,
                    true,
                    rpn2_detections.clone(),
                );
                self.train(config, request).await
            })
            .await?;
        let rcnn2 = expect_checkpoint(Stage::TrainRcnn2, rcnn2)?;

        let final_model = self
            .stage(Stage::CombineFinal, &mut run, async {
                self.combine(
                    Stage::CombineFinal,
                    &rpn2,
                    &rcnn2,
                    Checkpoint::new(names.final_model.clone(), 0),
                )
                .await
            })
            .await?;
        let final_model = expect_checkpoint(Stage::CombineFinal, final_model)?;

        info!(checkpoint = %final_model, "alternating training complete");

        Ok(PipelineOutcome {
            rpn1,
            rpn1_detections,
            rcnn1,
            rpn2,
            rpn2_detections,
            rcnn2_seed,
            rcnn2,
            final_model,
            skipped: run.skipped,
        })
    }

    /// Run one stage with state bookkeeping, or reuse its recorded output.
    async fn stage<F>(
        &self,
        stage: Stage,
        run: &mut RunLog,
        body: F,
    ) -> Result<StageOutput, PipelineError>
    where
        F: Future<Output = Result<StageOutput, PipelineError>>,
    {
        if self.skip_completed
            && let Some(state) = &self.state
        {
            let recorded = state
                .completed_output(stage, Some(&run.fingerprint))
                .map_err(|source| PipelineError::State { stage, source })?;
            if let Some(output) = recorded {
                info!(stage = %stage, "########## {} (already completed, skipping)", stage.title());
                run.skipped.push(stage);
                return Ok(output);
            }
            if state.status(stage).ok() == Some(StageStatus::Completed) {
                warn!(stage = %stage, "configuration changed since this stage completed, running it again");
            }
        }

        info!(stage = %stage, number = stage.number(), "########## {}", stage.title());
        let fingerprint = Some(run.fingerprint.as_str());
        self.record(stage, StageStatus::Running, None, None, fingerprint)?;

        match body.await {
            Ok(output) => {
                self.record(
                    stage,
                    StageStatus::Completed,
                    Some(output.clone()),
                    None,
                    fingerprint,
                )?;
                Ok(output)
            }
            Err(e) => {
                error!(stage = %stage, error = %e, "stage failed, aborting pipeline");
                // surface the stage error even if the failure record cannot be written
                if let Err(state_err) = self.record(
                    stage,
                    StageStatus::Failed,
                    None,
                    Some(e.to_string()),
                    fingerprint,
                ) {
                    error!(stage = %stage, error = %state_err, "could not record failure");
                }
                Err(e)
            }
        }
    }

    fn record(
        &self,
        stage: Stage,
        status: StageStatus,
        output: Option<StageOutput>,
        error: Option<String>,
        fingerprint: Option<&str>,
    ) -> Result<(), PipelineError> {
        match &self.state {
            Some(state) => state
                .save(stage, status, output, error, fingerprint)
                .map_err(|source| PipelineError::State { stage, source }),
            None => Ok(()),
        }
    }

    async fn train(
        &self,
        config: &PipelineConfig,
        request: TrainRequest,
    ) -> Result<StageOutput, PipelineError> {
        debug!(
            stage = %request.stage,
            seed = %request.seed,
            output = %request.output(),
            shared = request.shared,
            proposals = request.proposals.len(),
            "train request"
        );
        let checkpoint = self
            .trainer
            .train(config, &request)
            .await
            .map_err(|source| PipelineError::Stage {
                stage: request.stage,
                source,
            })?;
        Ok(StageOutput::Checkpoint { checkpoint })
    }

    /// Infer every partition; the stage completes only when all partitions have.
    async fn infer_partitions(
        &self,
        config: &PipelineConfig,
        stage: Stage,
        checkpoint: &Checkpoint,
    ) -> Result<StageOutput, PipelineError> {
        if config.devices.is_empty() {
            return Err(PipelineError::Stage {
                stage,
                source: StageError::NoDevices,
            });
        }
        let parallel = self.max_parallel.min(config.devices.len());
        let requests: Vec<InferRequest> = config
            .image_sets
            .iter()
            .zip(config.devices.iter().take(parallel).cycle())
            .map(|(partition, device)| {
                InferRequest::proposals(stage, checkpoint.clone(), partition, *device)
            })
            .collect();
        debug!(stage = %stage, partitions = requests.len(), parallel, "inference fan-out");

        let artifacts: Vec<DetectionArtifact> = stream::iter(
            requests
                .iter()
                .map(|request| self.inferencer.infer(config, request)),
        )
        .buffered(parallel)
        .try_collect()
        .await
        .map_err(|source| PipelineError::Stage { stage, source })?;

        Ok(StageOutput::Detections { artifacts })
    }

    /// Combining reads and writes whole checkpoints, so it runs on a blocking thread.
    async fn combine(
        &self,
        stage: Stage,
        first: &Checkpoint,
        second: &Checkpoint,
        output: Checkpoint,
    ) -> Result<StageOutput, PipelineError> {
        let combiner = Arc::clone(&self.combiner);
        let (first, second) = (first.clone(), second.clone());
        let target = output.clone();

        let checkpoint = tokio::task::spawn_blocking(move || {
            combiner.combine(&first, &second, &output)
        })
        .await
        .map_err(|e| CombineError::Aborted {
            checkpoint: target,
            message: e.to_string(),
        })
        .and_then(|result| result)
        .map_err(|source| PipelineError::Combine { stage, source })?;
        Ok(StageOutput::Checkpoint { checkpoint })
    }
}

/// One line per stage describing what it will read and write.
pub fn describe_plan(config: &PipelineConfig) -> Vec<String> {
    let n = &config.lineages;
    let rpn1 = Checkpoint::new(n.rpn1.clone(), config.rpn.end_epoch);
    let rcnn1 = Checkpoint::new(n.rcnn1.clone(), config.rcnn.end_epoch);
    let rpn2 = Checkpoint::new(n.rpn2.clone(), config.rpn.end_epoch);
    let rcnn2_seed = Checkpoint::new(n.rcnn2.clone(), 0);
    let rcnn2 = Checkpoint::new(n.rcnn2.clone(), config.rcnn.end_epoch);
    let final_model = Checkpoint::new(n.final_model.clone(), 0);
    let partitions = config.image_sets.join(", ");

    Stage::all()
        .iter()
        .map(|stage| {
            let detail = match stage {
                Stage::TrainRpn1 => format!("{} -> {} (shared=false)", config.pretrained, rpn1),
                Stage::InferRpn1 => format!("{} over [{}]", rpn1, partitions),
                Stage::TrainRcnn1 => format!(
                    "{} + {} proposals -> {} (shared=false)",
                    config.pretrained, rpn1, rcnn1
                ),
                Stage::TrainRpn2 => format!("{} -> {} (shared=true)", rcnn1, rpn2),
                Stage::InferRpn2 => format!("{} over [{}]", rpn2, partitions),
                Stage::CombineRcnn2 => format!("{} + {} -> {}", rpn2, rcnn1, rcnn2_seed),
                Stage::TrainRcnn2 => format!(
                    "{} + {} proposals -> {} (shared=true)",
                    rcnn2_seed, rpn2, rcnn2
                ),
                Stage::CombineFinal => format!("{} + {} -> {}", rpn2, rcnn2, final_model),
            };
            format!("{}. {:<14} {}", stage.number(), stage.as_str(), detail)
        })
        .collect()
}

fn train_request(
    stage: Stage,
    network: Network,
    seed: Checkpoint,
    output_prefix: &str,
    schedule: &StageSchedule,
    shared: bool,
    proposals: Vec<DetectionArtifact>,
) -> TrainRequest {
    TrainRequest {
        stage,
        network,
        seed,
        output_prefix: output_prefix.to_string(),
        epochs: EpochRange::from_zero(schedule.end_epoch),
        schedule: schedule.lr.clone(),
        shared,
        proposals,
    }
}

fn expect_checkpoint(stage: Stage, output: StageOutput) -> Result<Checkpoint, PipelineError> {
    output
        .checkpoint()
        .cloned()
        .ok_or_else(|| mismatched_output(stage, "a checkpoint"))
}

fn expect_artifacts(
    stage: Stage,
    output: StageOutput,
) -> Result<Vec<DetectionArtifact>, PipelineError> {
    output
        .artifacts()
        .map(<[DetectionArtifact]>::to_vec)
        .ok_or_else(|| mismatched_output(stage, "detection artifacts"))
}

fn mismatched_output(stage: Stage, expected: &str) -> PipelineError {
    PipelineError::State {
        stage,
        source: anyhow::anyhow!("recorded output of {} is not {}", stage, expected),
    }
}
