pub mod cache;
pub mod config;
pub mod crs;
pub mod eval;
pub mod period;

use anyhow::{Context, Result};
use std::sync::Arc;

use geoflow::cache::CacheStore;
use geoflow::config::GeoflowConfig;
use geoflow::eval::CommandExecutor;
use geoflow::expr::Registry;

use crate::cli::CommonConfigArgs;

/// Open the cache selected by flags and configuration
pub fn open_cache(
    config: &GeoflowConfig,
    common: &CommonConfigArgs,
    executor: Arc<dyn CommandExecutor>,
) -> Result<CacheStore> {
    let options = config.cache_options(common.cache_dir.as_deref())?;
    let root = options.root.clone();
    CacheStore::open(options, executor)
        .with_context(|| format!("Failed to open cache at {}", root.display()))
}

/// CRS of an expression, or the text itself when it does not parse
pub fn canonical(registry: &Registry, text: &str) -> String {
    registry
        .parse(text)
        .map(|node| node.crs())
        .unwrap_or_else(|_| text.trim().to_string())
}
