/// `geoflow cache` command implementation
///
/// Lists, measures and prunes cache entries and maintains the index.
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::sync::Arc;

use geoflow::cache::{parse_age, parse_size, CacheStore, CrsEntry, ListFilter};
use geoflow::config::GeoflowConfig;
use geoflow::eval::ShellExecutor;
use geoflow::expr::Registry;

use super::{canonical, open_cache};
use crate::cli::{CacheArgs, CacheCommands, CommonConfigArgs, FilterArgs};
use crate::cli_utils::{format_size, geoflow_prefix};

pub fn cache(args: &CacheArgs, config: &GeoflowConfig, common: &CommonConfigArgs) -> Result<()> {
    let registry = config.registry()?;
    let mut store = open_cache(config, common, Arc::new(ShellExecutor::new(false)))?;

    match &args.command {
        CacheCommands::List {
            filter,
            verbose,
            json,
        } => list(&mut store, filter, *verbose, *json)?,
        CacheCommands::Du { filter } => du(&mut store, filter)?,
        CacheCommands::Count { filter } => {
            println!("{}", store.count(&build_filter(filter)?)?);
        }
        CacheCommands::Clean { filter, all, force } => clean(&mut store, filter, *all, *force)?,
        CacheCommands::Drop { crs, force } => drop(&mut store, &registry, crs, *force)?,
        CacheCommands::Protect { crs, stop } => {
            let crs = canonical(&registry, crs);
            store
                .protect(&crs, *stop)
                .with_context(|| format!("Failed to change protection of {}", crs))?;
            let state = if *stop { "Unprotected" } else { "Protected" };
            println!("{} {}: {}", geoflow_prefix(), state, crs);
        }
        CacheCommands::Sync {
            rebuild_if_inconsistent,
        } => {
            let report = store
                .sync(*rebuild_if_inconsistent)
                .context("Failed to sync cache index")?;
            if report.rebuilt {
                println!("{} Index was inconsistent and has been rebuilt.", geoflow_prefix());
            }
            println!("{} Index saved ({} entries).", geoflow_prefix(), report.entries);
            return Ok(());
        }
        CacheCommands::Rebuild => {
            let count = store.rebuild().context("Failed to rebuild cache index")?;
            println!("{} Index rebuilt from stamps ({} entries).", geoflow_prefix(), count);
            return Ok(());
        }
        CacheCommands::Reset { force } => {
            let removed = store.reset(*force).context("Failed to reset cache")?;
            println!("{} Removed {} cached files.", geoflow_prefix(), removed);
            return Ok(());
        }
        CacheCommands::Rename { old, new } => {
            let old = canonical(&registry, old);
            let new = canonical(&registry, new);
            let path = store
                .rename(&old, &new)
                .with_context(|| format!("Failed to rename {}", old))?;
            println!("{} Renamed to {} ({})", geoflow_prefix(), new, path.display());
        }
    }

    store.close().context("Failed to save cache index")
}

fn build_filter(args: &FilterArgs) -> Result<ListFilter> {
    Ok(ListFilter {
        pattern: args.pattern.clone(),
        not_pattern: args.not_pattern.clone(),
        min_size: args.min_size.as_deref().map(parse_size).transpose()?,
        older_than: args.older_than.as_deref().map(parse_age).transpose()?,
        unused_for: args.unused_for.as_deref().map(parse_age).transpose()?,
    })
}

fn list(store: &mut CacheStore, filter: &FilterArgs, verbose: bool, json: bool) -> Result<()> {
    let entries = store
        .list(&build_filter(filter)?)
        .context("Failed to list cache entries")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No cached entries.");
        return Ok(());
    }

    for entry in &entries {
        print_entry(entry, verbose);
    }

    Ok(())
}

fn print_entry(entry: &CrsEntry, verbose: bool) {
    let marker = if entry.protected { "P" } else { "-" };
    println!("{} {:>10}  {}", marker, format_size(entry.size_bytes), entry.crs);

    if verbose {
        let modified: DateTime<Local> = entry.modified.into();
        let accessed: DateTime<Local> = entry.accessed.into();
        println!("    Path: {}", entry.path.display());
        println!("    Modified: {}", modified.format("%Y-%m-%d %H:%M:%S"));
        println!("    Accessed: {}", accessed.format("%Y-%m-%d %H:%M:%S"));
    }
}

fn du(store: &mut CacheStore, filter: &FilterArgs) -> Result<()> {
    let filter = build_filter(filter)?;
    let count = store.count(&filter).context("Failed to list cache entries")?;
    let total = store.usage(&filter).context("Failed to measure cache usage")?;

    println!("Entries: {}", count);
    println!("Total size: {} ({} bytes)", format_size(total), total);

    Ok(())
}

fn clean(store: &mut CacheStore, filter: &FilterArgs, all: bool, force: bool) -> Result<()> {
    if filter.is_empty() && !all {
        anyhow::bail!("Specify --all to clean every entry, or give a filter");
    }

    let removed = store
        .remove(&build_filter(filter)?, force)
        .context("Failed to clean cache")?;

    for crs in &removed {
        println!("{} Removed: {}", geoflow_prefix(), crs);
    }
    println!("{} {} entries removed.", geoflow_prefix(), removed.len());

    Ok(())
}

fn drop(store: &mut CacheStore, registry: &Registry, expressions: &[String], force: bool) -> Result<()> {
    for expression in expressions {
        let crs = canonical(registry, expression);
        if store
            .drop(&crs, force)
            .with_context(|| format!("Failed to drop {}", crs))?
        {
            println!("{} Dropped: {}", geoflow_prefix(), crs);
        } else {
            println!("{} Not cached: {}", geoflow_prefix(), crs);
        }
    }

    Ok(())
}
