//! Configuration view and validation commands: `devplane config`.

use std::path::Path;

use anyhow::{Result, bail};

use super::super::ConfigCommands;
use devplane::config::{CONFIG_DIR_NAME, CONFIG_FILE_NAME, PlaneConfig};

pub fn cmd_config(
    cwd: &Path,
    explicit: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let (config, source) = PlaneConfig::resolve(explicit, cwd)?;
            match source {
                Some(path) => println!("# Config file: {}", path.display()),
                None => println!("# No config file found, using defaults"),
            }
            println!("# Effective values (with env overrides):");
            println!();
            print!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let (config, source) = PlaneConfig::resolve(explicit, cwd)?;
            if source.is_none() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE_NAME);
                return Ok(());
            }

            let errors = config.validate();
            if errors.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration errors:");
                for error in &errors {
                    println!("  - {}", error);
                }
                bail!("{} configuration error(s)", errors.len());
            }
        }
        Some(ConfigCommands::Init { force }) => {
            let path = match explicit {
                Some(path) => path.to_path_buf(),
                None => cwd.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME),
            };
            if path.exists() && !force {
                println!("{} already exists at {}", CONFIG_FILE_NAME, path.display());
                println!("Pass --force to overwrite it.");
                return Ok(());
            }

            PlaneConfig::default().save(&path)?;

            println!("Created {} at {}", CONFIG_FILE_NAME, path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, dev_mode");
            println!("  - [builds] max_concurrent, timeout_secs, kill_grace_secs");
            println!("  - [commands] dev, build, deploy");
        }
    }

    Ok(())
}
