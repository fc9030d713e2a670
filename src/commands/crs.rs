/// `geoflow crs` command implementation
use anyhow::{Context, Result};

use geoflow::cache::crs_digest;
use geoflow::config::GeoflowConfig;

use crate::cli::CrsArgs;

pub fn run(args: &CrsArgs, config: &GeoflowConfig) -> Result<()> {
    let registry = config.registry()?;
    let node = registry
        .parse(&args.expression)
        .with_context(|| format!("Invalid expression: {}", args.expression))?;

    let crs = node.crs();
    println!("{}", crs);
    if args.hash {
        println!("{}", crs_digest(&crs));
    }

    Ok(())
}
