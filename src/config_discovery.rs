use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::GeoflowConfig;

pub const CONFIG_FILE: &str = "geoflow.toml";

/// Discovers geoflow configuration by traversing up the directory tree
pub fn discover_config(start_dir: &Path) -> Result<Option<PathBuf>> {
    let mut current = start_dir.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_FILE);
        if config_path.exists() {
            return Ok(Some(config_path));
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    // Fallback to global config
    if let Some(home) = dirs::home_dir() {
        let global_config = home.join(".config/geoflow/config.toml");
        if global_config.exists() {
            return Ok(Some(global_config));
        }
    }

    Ok(None)
}

/// Loads and validates configuration with auto-discovery support
///
/// If `explicit_path` is provided, loads config from that path.
/// Otherwise, auto-discovers config by traversing up directory tree from cwd,
/// falling back to defaults when nothing is found.
pub fn load_config_with_discovery(explicit_path: Option<&Path>) -> Result<GeoflowConfig> {
    let config = if let Some(config_path) = explicit_path {
        GeoflowConfig::from_file(config_path)?
    } else {
        let current_dir = std::env::current_dir()
            .context("Failed to get current directory for config discovery")?;

        match discover_config(&current_dir)? {
            Some(config_path) => {
                info!("Using config: {}", config_path.display());
                GeoflowConfig::from_file(&config_path)?
            }
            None => {
                warn!("No configuration file found, using defaults");
                GeoflowConfig::default()
            }
        }
    };

    config.validate()?;
    Ok(config)
}
