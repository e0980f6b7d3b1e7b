//! Configuration view and creation (`crewforge config`).

use anyhow::{Context, Result};
use std::path::Path;

use crewforge::config::{CrewforgeToml, config_path};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let path = config_path(project_dir);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Crewforge Configuration");
            println!("=======================");
            println!();

            let toml = if path.exists() {
                println!("Config file: {}", path.display());
                CrewforgeToml::load(&path)?
            } else {
                println!("No crewforge.toml found at {}", path.display());
                println!("Using default configuration.");
                CrewforgeToml::default()
            };
            println!();

            let rendered =
                toml::to_string_pretty(&toml).context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();

            let mut effective = toml.run.clone();
            effective.apply_env()?;
            println!("Effective values (with env overrides):");
            println!("  generator.command = \"{}\"", toml.generator.command());
            println!("  run.auto_approve = {}", effective.auto_approve);
            println!("  run.budget_limit = {}", effective.budget_limit);
            println!("  run.firing_threshold = {}", effective.firing_threshold);
            println!("  run.min_review_samples = {}", effective.min_review_samples);
            match effective.summarize_threshold() {
                Ok(tokens) => println!("  summarize at {} tokens", tokens),
                Err(e) => println!("  invalid: {}", e),
            }
            if let Err(e) = effective.validate(toml.hosting.repo.is_some()) {
                println!();
                println!("Warning: {}", e);
            }
            println!();
        }
        Some(ConfigCommands::Init { force }) => {
            if path.exists() && !force {
                println!("crewforge.toml already exists at {}", path.display());
                println!("Pass --force to overwrite it.");
                return Ok(());
            }

            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
            CrewforgeToml::default().save(&path)?;

            println!("Created crewforge.toml at {}", path.display());
            println!();
            println!("You can now customize:");
            println!("  - [run] budget_limit, summarize_at, firing_threshold, auto_approve");
            println!("  - [generator] command, args, timeout_secs");
            println!("  - [hosting] repo, api_url");
            println!("  - [notifications] webhook_url");
            println!();
        }
    }

    Ok(())
}
