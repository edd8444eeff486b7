use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use alternate::config::CliOverrides;

mod cmd;

#[derive(Parser)]
#[command(name = "alternate")]
#[command(version, about = "Alternating RPN/RCNN training orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Directory holding alternate.toml, checkpoints and the state log
    #[arg(long, global = true)]
    pub work_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the alternating training schedule
    Train(TrainArgs),
    /// Show the state of the last pipeline run
    Status,
    /// Forget the state of the last pipeline run
    Reset {
        #[arg(long)]
        force: bool,
    },
    /// Merge two checkpoints, first input winning on shared layers
    Combine {
        /// First checkpoint as <prefix>:<epoch>
        #[arg(long)]
        first: String,
        /// Second checkpoint as <prefix>:<epoch>
        #[arg(long)]
        second: String,
        /// Output checkpoint as <prefix>:<epoch>
        #[arg(long)]
        output: String,
    },
    /// Convert a detections file into submission text
    Submission {
        /// Detections JSON indexed by class then image
        #[arg(long, alias = "pklfileIn")]
        input: PathBuf,
        #[arg(long, alias = "txtfileOut", default_value = alternate::submission::DEFAULT_OUTPUT)]
        output: PathBuf,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the resolved configuration
    Show,
    /// Validate alternate.toml and show any warnings
    Validate,
}

#[derive(Args, Clone, Debug, Default)]
pub struct TrainArgs {
    /// Network name
    #[arg(long)]
    pub network: Option<String>,
    /// Dataset name
    #[arg(long)]
    pub dataset: Option<String>,
    /// Image set name; join partitions with '+'
    #[arg(long, alias = "image_set")]
    pub image_set: Option<String>,
    /// Output data folder
    #[arg(long, alias = "root_path")]
    pub root_path: Option<PathBuf>,
    /// Dataset path
    #[arg(long, alias = "dataset_path")]
    pub dataset_path: Option<PathBuf>,
    /// Frequency of logging inside the trainer
    #[arg(long)]
    pub frequent: Option<u32>,
    /// The kv-store type
    #[arg(long)]
    pub kvstore: Option<String>,
    /// Work load for different devices, comma separated
    #[arg(long, alias = "work_load_list")]
    pub work_load_list: Option<String>,
    /// Disable flip images
    #[arg(long, alias = "no_flip")]
    pub no_flip: bool,
    /// Disable random shuffle
    #[arg(long, alias = "no_shuffle")]
    pub no_shuffle: bool,
    /// Continue training inside each trainer
    #[arg(long)]
    pub resume: bool,
    /// GPU devices to train with, comma separated
    #[arg(long)]
    pub gpus: Option<String>,
    /// Pretrained model prefix
    #[arg(long)]
    pub pretrained: Option<String>,
    /// Pretrained model epoch
    #[arg(long, alias = "pretrained_epoch")]
    pub pretrained_epoch: Option<u32>,
    /// End epoch of rpn training
    #[arg(long, alias = "rpn_epoch")]
    pub rpn_epoch: Option<u32>,
    /// Base learning rate of rpn training
    #[arg(long, alias = "rpn_lr")]
    pub rpn_lr: Option<f64>,
    /// Rpn learning rate steps (in epoch)
    #[arg(long, alias = "rpn_lr_step")]
    pub rpn_lr_step: Option<String>,
    /// End epoch of rcnn training
    #[arg(long, alias = "rcnn_epoch")]
    pub rcnn_epoch: Option<u32>,
    /// Base learning rate of rcnn training
    #[arg(long, alias = "rcnn_lr")]
    pub rcnn_lr: Option<f64>,
    /// Rcnn learning rate steps (in epoch)
    #[arg(long, alias = "rcnn_lr_step")]
    pub rcnn_lr_step: Option<String>,
    /// Use roi global context for classification
    #[arg(long, alias = "use_global_context")]
    pub use_global_context: bool,
    /// Randomly transform image in color, brightness, contrast, sharpness
    #[arg(long, alias = "use_data_augmentation")]
    pub use_data_augmentation: bool,
    /// Replace ROIPooling with ROIAlign
    #[arg(long, alias = "use_roi_align")]
    pub use_roi_align: bool,
    /// Print the stage plan and exit
    #[arg(long)]
    pub dry_run: bool,
    /// Skip stages the previous run already completed
    #[arg(long)]
    pub continue_pipeline: bool,
}

impl From<&TrainArgs> for CliOverrides {
    fn from(args: &TrainArgs) -> Self {
        CliOverrides {
            network: args.network.clone(),
            dataset: args.dataset.clone(),
            image_set: args.image_set.clone(),
            root_path: args.root_path.clone(),
            dataset_path: args.dataset_path.clone(),
            frequent: args.frequent,
            kvstore: args.kvstore.clone(),
            work_load_list: args.work_load_list.clone(),
            no_flip: args.no_flip,
            no_shuffle: args.no_shuffle,
            resume: args.resume,
            gpus: args.gpus.clone(),
            pretrained: args.pretrained.clone(),
            pretrained_epoch: args.pretrained_epoch,
            rpn_epoch: args.rpn_epoch,
            rpn_lr: args.rpn_lr,
            rpn_lr_step: args.rpn_lr_step.clone(),
            rcnn_epoch: args.rcnn_epoch,
            rcnn_lr: args.rcnn_lr,
            rcnn_lr_step: args.rcnn_lr_step.clone(),
            use_global_context: args.use_global_context,
            use_data_augmentation: args.use_data_augmentation,
            use_roi_align: args.use_roi_align,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    alternate::telemetry::init_logging(cli.verbose, cli.log_json);

    // stage commands run inside the work dir, so every path handed to them must be absolute
    let work_dir = match cli.work_dir.clone() {
        Some(dir) => std::path::absolute(&dir)
            .with_context(|| format!("Failed to resolve work directory {}", dir.display()))?,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Train(args) => cmd::cmd_train(&work_dir, args).await?,
        Commands::Status => cmd::cmd_status(&work_dir)?,
        Commands::Reset { force } => cmd::cmd_reset(&work_dir, *force)?,
        Commands::Combine {
            first,
            second,
            output,
        } => cmd::cmd_combine(&work_dir, first, second, output)?,
        Commands::Submission { input, output } => cmd::cmd_submission(input, output)?,
        Commands::Config { command } => cmd::cmd_config(&work_dir, command.clone())?,
    }

    Ok(())
}
