use anyhow::{Context, Result};
use keel_core::RuntimeConfig;
use std::process::ExitCode;

use crate::cli::{Cli, Commands};

pub mod check_feature;
pub mod features;
pub mod update;

/// Dispatch command to appropriate handler
pub async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = runtime_config(&cli)?;

    match cli.command {
        Commands::Update(args) => update::execute(&config, args).await.map(|()| ExitCode::SUCCESS),
        Commands::CheckFeature { name } => check_feature::execute(&name),
        Commands::Features => features::execute(&config).map(|()| ExitCode::SUCCESS),
    }
}

/// Defaults, then the config file, then `KEEL_*` variables, then flags
fn runtime_config(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    config = config.from_env().context("Invalid KEEL_* environment override")?;

    if let Some(root) = &cli.cgroup_root {
        config = config.with_cgroup_root(root);
    }
    if let Some(parent) = &cli.cgroup_parent {
        config = config.with_cgroup_parent(parent);
    }
    if let Some(version) = cli.cgroup_version {
        config = config.with_cgroup_version(version);
    }
    config.validate().context("Invalid runtime configuration")?;
    Ok(config)
}
