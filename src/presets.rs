//! Built-in network and dataset presets.
//!
//! A preset supplies the defaults every CLI flag falls back to. Selecting a
//! network or dataset that has no preset is a configuration error.

use serde::Serialize;

use crate::errors::ConfigError;

/// Backbone-dependent defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkPreset {
    pub name: &'static str,
    pub pretrained: &'static str,
    pub pretrained_epoch: u32,
    pub rpn_lr: f64,
    pub rcnn_lr: f64,
}

/// Dataset-dependent defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetPreset {
    pub name: &'static str,
    pub image_set: &'static str,
    pub root_path: &'static str,
    pub dataset_path: &'static str,
    pub num_classes: usize,
    pub rpn_epoch: u32,
    pub rpn_lr_step: &'static str,
    pub rcnn_epoch: u32,
    pub rcnn_lr_step: &'static str,
}

pub const DEFAULT_NETWORK: &str = "vgg";
pub const DEFAULT_DATASET: &str = "PascalVOC";

const NETWORKS: &[NetworkPreset] = &[
    NetworkPreset {
        name: "vgg",
        pretrained: "model/vgg16",
        pretrained_epoch: 0,
        rpn_lr: 0.001,
        rcnn_lr: 0.001,
    },
    NetworkPreset {
        name: "resnet",
        pretrained: "model/resnet-101",
        pretrained_epoch: 0,
        rpn_lr: 0.001,
        rcnn_lr: 0.001,
    },
];

const DATASETS: &[DatasetPreset] = &[
    DatasetPreset {
        name: "PascalVOC",
        image_set: "2007_trainval",
        root_path: "data",
        dataset_path: "data/VOCdevkit",
        num_classes: 21,
        rpn_epoch: 8,
        rpn_lr_step: "6",
        rcnn_epoch: 8,
        rcnn_lr_step: "6",
    },
    DatasetPreset {
        name: "coco",
        image_set: "train2014",
        root_path: "data",
        dataset_path: "data/coco",
        num_classes: 81,
        rpn_epoch: 8,
        rpn_lr_step: "6",
        rcnn_epoch: 8,
        rcnn_lr_step: "6",
    },
    DatasetPreset {
        name: "imagenet",
        image_set: "train",
        root_path: "data",
        dataset_path: "data/imagenet",
        num_classes: 201,
        rpn_epoch: 8,
        rpn_lr_step: "6",
        rcnn_epoch: 8,
        rcnn_lr_step: "6",
    },
];

/// Look up a network preset by name (case-insensitive).
pub fn network(name: &str) -> Result<&'static NetworkPreset, ConfigError> {
    NETWORKS
        .iter()
        .find(|n| n.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| ConfigError::UnknownNetwork(name.to_string()))
}

/// Look up a dataset preset by name (case-insensitive).
pub fn dataset(name: &str) -> Result<&'static DatasetPreset, ConfigError> {
    DATASETS
        .iter()
        .find(|d| d.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| ConfigError::UnknownDataset(name.to_string()))
}
