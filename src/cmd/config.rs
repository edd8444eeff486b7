//! Configuration view and validation commands (`alternate config`).

use anyhow::{Context, Result};

use super::super::ConfigCommands;

pub fn cmd_config(work_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use alternate::config::{AlternateToml, CONFIG_FILE_NAME, CliOverrides, PipelineConfig};

    let config_path = work_dir.join(CONFIG_FILE_NAME);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Alternate Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found at {}", CONFIG_FILE_NAME, work_dir.display());
                println!("Using default configuration.");
            }
            println!();

            // Effective values include ALTERNATE_*_CMD overrides
            let file = AlternateToml::load_or_default(work_dir)?.with_env_overrides();
            let rendered =
                toml::to_string_pretty(&file).context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();

            println!("Resolved pipeline defaults:");
            println!();
            let pipeline = PipelineConfig::resolve(&CliOverrides::default(), &file)?;
            let rendered =
                toml::to_string_pretty(&pipeline).context("Failed to render pipeline config")?;
            println!("{}", rendered.trim_end());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let file = AlternateToml::load_or_default(work_dir)?.with_env_overrides();
            let warnings = file.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
    }
    Ok(())
}
