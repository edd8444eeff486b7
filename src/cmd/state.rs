//! Stage state commands (`alternate status` and `alternate reset`).

use anyhow::Result;
use std::path::Path;

use alternate::config::AlternateToml;
use alternate::orchestrator::{STATE_FILE_NAME, StageStatus, StateManager};

/// State log location for `work_dir`, honoring `[paths].state_dir`.
pub fn state_manager(work_dir: &Path, toml: &AlternateToml) -> StateManager {
    StateManager::new(work_dir.join(&toml.paths.state_dir).join(STATE_FILE_NAME))
}

pub fn cmd_status(work_dir: &Path) -> Result<()> {
    let toml = AlternateToml::load_or_default(work_dir)?;
    let state = state_manager(work_dir, &toml);

    println!();
    println!("Alternating Training Status");
    println!("===========================");
    println!();

    let summary = state.summary()?;
    if summary.iter().all(|(_, entry)| entry.is_none()) {
        println!("Execution: Not started");
        println!();
        println!("Run 'alternate train' to start the pipeline.");
        println!();
        return Ok(());
    }

    println!("State file: {}", state.path().display());
    println!();
    for (stage, entry) in summary {
        let status = entry.as_ref().map(|e| e.status).unwrap_or_default();
        let label = format!("{:<10}", status.as_str());
        let styled = match status {
            StageStatus::Completed => console::style(label).green(),
            StageStatus::Failed => console::style(label).red(),
            StageStatus::Running => console::style(label).yellow(),
            StageStatus::Pending => console::style(label).dim(),
        };
        print!("  {}. {:<14} {}", stage.number(), stage.as_str(), styled);

        if let Some(entry) = entry {
            print!(" {}", entry.timestamp.format("%Y-%m-%d %H:%M:%S"));
            if let Some(ckpt) = entry.output.as_ref().and_then(|o| o.checkpoint()) {
                print!("  {}", ckpt);
            }
            if let Some(artifacts) = entry.output.as_ref().and_then(|o| o.artifacts()) {
                print!("  {} partition(s)", artifacts.len());
            }
            if let Some(error) = &entry.error {
                print!("  {}", console::style(error).red());
            }
        }
        println!();
    }
    println!();
    Ok(())
}

pub fn cmd_reset(work_dir: &Path, force: bool) -> Result<()> {
    use dialoguer::Confirm;

    let toml = AlternateToml::load_or_default(work_dir)?;

    if !force {
        let confirm = Confirm::new()
            .with_prompt("This will forget all stage progress. Are you sure?")
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    state_manager(work_dir, &toml).reset()?;
    println!("Reset complete");
    Ok(())
}
