//! Alternating training run (`alternate train`).

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use super::super::TrainArgs;
use super::state::state_manager;

pub async fn cmd_train(work_dir: &Path, args: &TrainArgs) -> Result<()> {
    use alternate::checkpoint::CheckpointStore;
    use alternate::combine::ParamsCombiner;
    use alternate::config::{AlternateToml, CliOverrides, PipelineConfig};
    use alternate::orchestrator::{AlternateTrainer, describe_plan};
    use alternate::runner::CommandRunner;

    let toml = AlternateToml::load_or_default(work_dir)?.with_env_overrides();
    let config = PipelineConfig::resolve(&CliOverrides::from(args), &toml)
        .context("Invalid training configuration")?;

    tracing::info!(
        network = %config.network,
        dataset = %config.dataset,
        image_set = %config.image_set(),
        devices = ?config.devices,
        "resolved pipeline configuration"
    );

    if args.dry_run {
        println!();
        println!("Alternating training plan");
        println!("=========================");
        println!();
        for line in describe_plan(&config) {
            println!("  {}", line);
        }
        println!();
        return Ok(());
    }

    let store = CheckpointStore::new(work_dir);
    let runner = Arc::new(CommandRunner::new(
        toml.runner.clone(),
        work_dir,
        store.clone(),
    ));
    let combiner = Arc::new(ParamsCombiner::new(store.clone()));

    let state = state_manager(work_dir, &toml);
    if !args.continue_pipeline {
        state.reset()?;
    }

    let trainer = AlternateTrainer::new(runner.clone(), runner, combiner)
        .with_state(state, args.continue_pipeline)
        .with_max_parallel(toml.inference.max_parallel);

    let outcome = match trainer.run(&config).await {
        Ok(outcome) => outcome,
        Err(e) => {
            println!(
                "  {} stage {} failed",
                console::style("Error:").red().bold(),
                e.stage()
            );
            return Err(e.into());
        }
    };

    if !outcome.skipped.is_empty() {
        let skipped: Vec<&str> = outcome.skipped.iter().map(|s| s.as_str()).collect();
        println!(
            "{} {}",
            console::style("Reused from previous run:").dim(),
            skipped.join(", ")
        );
    }
    println!(
        "{} {}",
        console::style("Final model:").green().bold(),
        store.path(&outcome.final_model).display()
    );
    Ok(())
}
