//! Merging two independently trained checkpoints into one.
//!
//! The first checkpoint supplies every layer it has (shared backbone plus RPN
//! head); the second fills in whatever the first lacks (the RCNN head). The two
//! must share at least one trainable layer, and every shared layer must agree
//! on shape, otherwise the merge is refused rather than producing a partial
//! model.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, CheckpointStore, ParamsFile, Tensor};
use crate::errors::CombineError;

/// Produces a new checkpoint from two existing ones without touching either.
pub trait ModelCombiner: Send + Sync {
    fn combine(
        &self,
        first: &Checkpoint,
        second: &Checkpoint,
        output: &Checkpoint,
    ) -> Result<Checkpoint, CombineError>;
}

/// Combiner over the crate's `.params.json` checkpoint files.
#[derive(Debug, Clone)]
pub struct ParamsCombiner {
    store: CheckpointStore,
}

impl ParamsCombiner {
    pub fn new(store: CheckpointStore) -> Self {
        Self { store }
    }

    fn load(&self, checkpoint: &Checkpoint) -> Result<ParamsFile, CombineError> {
        if !self.store.exists(checkpoint) {
            return Err(CombineError::MissingCheckpoint {
                checkpoint: checkpoint.clone(),
                path: self.store.path(checkpoint),
            });
        }
        self.store
            .load(checkpoint)
            .map_err(|e| CombineError::Unreadable {
                checkpoint: checkpoint.clone(),
                message: format!("{:#}", e),
            })
    }
}

impl ModelCombiner for ParamsCombiner {
    fn combine(
        &self,
        first: &Checkpoint,
        second: &Checkpoint,
        output: &Checkpoint,
    ) -> Result<Checkpoint, CombineError> {
        let params1 = self.load(first)?;
        let params2 = self.load(second)?;

        let merged = merge_params(first, &params1, second, &params2)?;
        info!(
            first = %first,
            second = %second,
            output = %output,
            arg_params = merged.arg_params.len(),
            aux_params = merged.aux_params.len(),
            "combined checkpoints"
        );

        self.store
            .save(output, &merged)
            .map_err(|source| CombineError::WriteFailed {
                checkpoint: output.clone(),
                source,
            })?;
        Ok(output.clone())
    }
}

/// Merge two parameter files, first input winning on shared names.
pub fn merge_params(
    first: &Checkpoint,
    params1: &ParamsFile,
    second: &Checkpoint,
    params2: &ParamsFile,
) -> Result<ParamsFile, CombineError> {
    let shared_args = check_shared(first, &params1.arg_params, second, &params2.arg_params)?;
    if shared_args == 0 {
        return Err(CombineError::NoSharedLayers {
            first: first.clone(),
            second: second.clone(),
            section: "arg",
        });
    }
    // aux params (batch-norm statistics) may legitimately be absent on both sides
    check_shared(first, &params1.aux_params, second, &params2.aux_params)?;

    Ok(ParamsFile {
        arg_params: union(&params1.arg_params, &params2.arg_params),
        aux_params: union(&params1.aux_params, &params2.aux_params),
    })
}

/// Count shared layer names, failing on the first shape disagreement.
fn check_shared(
    first: &Checkpoint,
    params1: &BTreeMap<String, Tensor>,
    second: &Checkpoint,
    params2: &BTreeMap<String, Tensor>,
) -> Result<usize, CombineError> {
    let mut shared = 0;
    for (name, t1) in params1 {
        let Some(t2) = params2.get(name) else {
            continue;
        };
        if t1.shape != t2.shape {
            return Err(CombineError::ShapeMismatch {
                layer: name.clone(),
                first: first.clone(),
                first_shape: t1.shape.clone(),
                second: second.clone(),
                second_shape: t2.shape.clone(),
            });
        }
        shared += 1;
    }
    debug!(first = %first, second = %second, shared, "shared layers");
    Ok(shared)
}

fn union(
    params1: &BTreeMap<String, Tensor>,
    params2: &BTreeMap<String, Tensor>,
) -> BTreeMap<String, Tensor> {
    let mut merged = params2.clone();
    for (name, tensor) in params1 {
        merged.insert(name.clone(), tensor.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tensor(value: f32) -> Tensor {
        Tensor::new(vec![2], vec![value, value])
    }

    fn rpn_params() -> ParamsFile {
        let mut p = ParamsFile::default();
        p.arg_params.insert("conv1_weight".into(), tensor(1.0));
        p.arg_params.insert("rpn_cls_score_weight".into(), tensor(1.5));
        p
    }

    fn rcnn_params() -> ParamsFile {
        let mut p = ParamsFile::default();
        p.arg_params.insert("conv1_weight".into(), tensor(2.0));
        p.arg_params.insert("cls_score_weight".into(), tensor(2.5));
        p.aux_params.insert("bn_moving_var".into(), tensor(0.3));
        p
    }

    fn setup() -> (tempfile::TempDir, CheckpointStore, Checkpoint, Checkpoint) {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let rpn = Checkpoint::new("model/rpn2", 8);
        let rcnn = Checkpoint::new("model/rcnn1", 8);
        store.save(&rpn, &rpn_params()).unwrap();
        store.save(&rcnn, &rcnn_params()).unwrap();
        (dir, store, rpn, rcnn)
    }

    #[test]
    fn test_first_input_wins_on_shared_layers() {
        let (_dir, store, rpn, rcnn) = setup();
        let combiner = ParamsCombiner::new(store.clone());
        let out = Checkpoint::new("model/rcnn2", 0);

        combiner.combine(&rpn, &rcnn, &out).unwrap();
        let merged = store.load(&out).unwrap();

        assert_eq!(merged.arg_params.len(), 3);
        assert_eq!(merged.arg_params["conv1_weight"], tensor(1.0));
        assert_eq!(merged.arg_params["rpn_cls_score_weight"], tensor(1.5));
        assert_eq!(merged.arg_params["cls_score_weight"], tensor(2.5));
        assert_eq!(merged.aux_params["bn_moving_var"], tensor(0.3));
    }

    #[test]
    fn test_inputs_are_untouched() {
        let (_dir, store, rpn, rcnn) = setup();
        let before_rpn = std::fs::read(store.path(&rpn)).unwrap();
        let before_rcnn = std::fs::read(store.path(&rcnn)).unwrap();

        ParamsCombiner::new(store.clone())
            .combine(&rpn, &rcnn, &Checkpoint::new("model/final", 0))
            .unwrap();

        assert_eq!(std::fs::read(store.path(&rpn)).unwrap(), before_rpn);
        assert_eq!(std::fs::read(store.path(&rcnn)).unwrap(), before_rcnn);
    }

    #[test]
    fn test_rerun_is_byte_identical() {
        let (_dir, store, rpn, rcnn) = setup();
        let combiner = ParamsCombiner::new(store.clone());
        let out = Checkpoint::new("model/final", 0);

        combiner.combine(&rpn, &rcnn, &out).unwrap();
        let first_run = std::fs::read(store.path(&out)).unwrap();
        combiner.combine(&rpn, &rcnn, &out).unwrap();
        let second_run = std::fs::read(store.path(&out)).unwrap();

        assert_eq!(first_run, second_run);
    }

    #[test]
    fn test_missing_input_fails_without_output() {
        let (_dir, store, rpn, _rcnn) = setup();
        let missing = Checkpoint::new("model/rcnn9", 3);
        let out = Checkpoint::new("model/final", 0);

        let err = ParamsCombiner::new(store.clone())
            .combine(&rpn, &missing, &out)
            .unwrap_err();

        match err {
            CombineError::MissingCheckpoint { checkpoint, .. } => assert_eq!(checkpoint, missing),
            other => panic!("Expected MissingCheckpoint, got {other:?}"),
        }
        assert!(!store.exists(&out));
    }

    #[test]
    fn test_disjoint_layers_rejected() {
        let (_dir, store, rpn, _) = setup();
        let other = Checkpoint::new("model/other", 1);
        let mut params = ParamsFile::default();
        params.arg_params.insert("fc9_weight".into(), tensor(9.0));
        store.save(&other, &params).unwrap();

        let err = ParamsCombiner::new(store)
            .combine(&rpn, &other, &Checkpoint::new("model/final", 0))
            .unwrap_err();
        assert!(matches!(err, CombineError::NoSharedLayers { section: "arg", .. }));
    }

    #[test]
    fn test_shape_mismatch_names_layer() {
        let (_dir, store, rpn, _) = setup();
        let other = Checkpoint::new("model/wide", 1);
        let mut params = ParamsFile::default();
        params.arg_params.insert(
            "conv1_weight".into(),
            Tensor::new(vec![3], vec![0.0, 0.0, 0.0]),
        );
        store.save(&other, &params).unwrap();

        let err = ParamsCombiner::new(store)
            .combine(&rpn, &other, &Checkpoint::new("model/final", 0))
            .unwrap_err();
        match err {
            CombineError::ShapeMismatch { layer, second, .. } => {
                assert_eq!(layer, "conv1_weight");
                assert_eq!(second, other);
            }
            other => panic!("Expected ShapeMismatch, got {other:?}"),
        }
    }
}
