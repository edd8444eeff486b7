//! Standalone checkpoint merge (`alternate combine`).

use anyhow::{Context, Result};
use std::path::Path;

pub fn cmd_combine(work_dir: &Path, first: &str, second: &str, output: &str) -> Result<()> {
    use alternate::checkpoint::{Checkpoint, CheckpointStore};
    use alternate::combine::{ModelCombiner, ParamsCombiner};

    let first: Checkpoint = first.parse().context("Invalid --first")?;
    let second: Checkpoint = second.parse().context("Invalid --second")?;
    let output: Checkpoint = output.parse().context("Invalid --output")?;

    let store = CheckpointStore::new(work_dir);
    let combined = ParamsCombiner::new(store.clone()).combine(&first, &second, &output)?;

    println!(
        "{} {}",
        console::style("Combined:").green().bold(),
        store.path(&combined).display()
    );
    Ok(())
}
