//! Configuration view and validation commands: `draftline config`.

use anyhow::{Context, Result};
use std::path::Path;

use draftline::config::{CONFIG_DIR, CONFIG_FILE, DraftlineConfig, DraftlineToml};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", console::style("Draftline Configuration").bold().cyan());
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No draftline.toml found at {}", config_path.display());
                println!("Using defaults. Run 'draftline config init' to create one.");
            }
            println!();

            // Effective values include environment overrides.
            let config = DraftlineConfig::new(project_dir.to_path_buf())?;
            let rendered = toml::to_string_pretty(&config.toml)
                .context("Failed to serialize configuration")?;
            println!("{}", rendered.trim_end());
            println!();
            println!("Database: {}", config.db_path().display());
            let key_env = &config.toml.llm.api_key_env;
            let key_state = if std::env::var(key_env).is_ok() {
                console::style("set").green()
            } else {
                console::style("missing").red()
            };
            println!("API key ({}): {}", key_env, key_state);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No draftline.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = DraftlineToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("{}", console::style("Configuration is valid.").green());
            } else {
                println!("{}", console::style("Configuration warnings:").yellow());
                for warning in &warnings {
                    println!("  - {}", warning);
                }
                println!();
                anyhow::bail!("{} configuration warning(s)", warnings.len());
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("draftline.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create {}", config_dir.display()))?;
            DraftlineToml::default().save(&config_path)?;

            println!("Created draftline.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [pipeline] stage_attempts, retry_backoff_ms, stage_timeout_secs, log_dir");
            println!("  - [loops] bounds, length tolerance, originality threshold");
            println!("  - [llm] base_url, model, api_key_env");
            println!("  - [throttle.<service>] max_concurrent, min_interval_ms");
            println!();
        }
    }

    Ok(())
}
