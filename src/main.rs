mod cli;
mod cli_utils;
mod commands;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};
use geoflow::config_discovery::load_config_with_discovery;
use geoflow::logging;

fn main() -> Result<()> {
    logging::init();

    let cli = Cli::parse();

    // Period arithmetic needs no configuration
    if let Commands::Period(args) = &cli.command {
        return commands::period::run(&args.command);
    }

    let config = load_config_with_discovery(cli.common.config.as_deref())?;

    match &cli.command {
        Commands::Eval(args) => commands::eval::run(args, &config, &cli.common),
        Commands::Crs(args) => commands::crs::run(args, &config),
        Commands::Period(args) => commands::period::run(&args.command),
        Commands::Cache(args) => commands::cache::cache(args, &config, &cli.common),
        Commands::Config(args) => commands::config::run(&args.command, &config, &cli.common),
    }
}
