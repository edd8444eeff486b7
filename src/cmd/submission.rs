//! Detection-result conversion (`alternate submission`).

use anyhow::Result;
use std::path::Path;

pub fn cmd_submission(input: &Path, output: &Path) -> Result<()> {
    let lines = alternate::submission::convert_file(input, output)?;
    println!("Wrote {} detections to {}", lines, output.display());
    Ok(())
}
