use anyhow::Result;
use std::path::Path;
use tracing::info;

use geoflow::config::GeoflowConfig;

use crate::cli::{CommonConfigArgs, ConfigCommands};
use crate::cli_utils::geoflow_prefix;

pub fn run(command: &ConfigCommands, config: &GeoflowConfig, common: &CommonConfigArgs) -> Result<()> {
    match command {
        ConfigCommands::Validate { path } => validate(path, common),
        ConfigCommands::Show => show(config),
    }
}

fn validate(path: &Path, common: &CommonConfigArgs) -> Result<()> {
    info!("Validating config file: {}", path.display());

    let config = GeoflowConfig::from_file(path)?;
    config.validate()?;
    let registry = config.registry()?;

    println!("{} Configuration file is valid: {}", geoflow_prefix(), path.display());
    println!("\nSummary:");
    println!(
        "  - Cache directory: {}",
        config.cache_dir(common.cache_dir.as_deref()).display()
    );
    println!("  - Stamping: {}", config.cache.stamping);
    println!("  - Operators: {}", registry.operator_names().collect::<Vec<_>>().join(", "));
    println!("  - Dataset sources: {}", config.datasets.len());
    println!("  - Derived variables: {}", config.derived.len());
    println!("  - Macros: {}", config.macros.len());

    Ok(())
}

fn show(config: &GeoflowConfig) -> Result<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
