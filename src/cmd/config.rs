//! Configuration view and validation commands: `kds config`.

use std::path::Path;

use anyhow::Result;

use kds::config::{CONFIG_FILE, KdsConfig};

use super::super::ConfigCommands;

pub fn cmd_config(config_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("KDS Configuration");
            println!("=================");
            println!();

            let file_config = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                KdsConfig::load(&config_path)?
            } else {
                println!("No kds.toml found at {}", config_path.display());
                println!("Using default configuration.");
                KdsConfig::default()
            };
            println!();

            let mut effective = file_config.clone();
            effective.apply_env()?;
            print!("{}", toml::to_string_pretty(&effective)?);
            println!();

            if effective != file_config {
                println!("(KDS_PORT / KDS_DB_PATH overrides applied)");
                println!();
            }
            if !config_path.exists() {
                println!("Run 'kds config init' to create a kds.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No kds.toml found. Using defaults (valid).");
                return Ok(());
            }

            let config = KdsConfig::load(&config_path)?;
            let warnings = config.validate();

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
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("kds.toml already exists at {}", config_path.display());
                println!("Remove it first to re-initialize.");
                return Ok(());
            }

            KdsConfig::default().save(&config_path)?;
            println!("Created {}", config_path.display());
        }
    }

    Ok(())
}
