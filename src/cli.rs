use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// geoflow - cached evaluation of geophysical data expressions
///
/// Expressions chain external operators over datasets. Every intermediate
/// result is cached on disk under its canonical expression string (CRS) and
/// reused, whole or in part, by later evaluations.
#[derive(Parser, Debug)]
#[command(name = "geoflow")]
#[command(author = "geoflow developers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Cached evaluation of geophysical data expressions", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonConfigArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Configuration arguments shared across commands
#[derive(Args, Debug, Clone, Default)]
pub struct CommonConfigArgs {
    /// Config file path (default: nearest geoflow.toml)
    #[arg(short = 'c', long, env = "GEOFLOW_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Cache directory
    #[arg(long, env = "GEOFLOW_CACHE_DIR", global = true)]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Evaluate an expression, computing and caching whatever is missing
    Eval(EvalArgs),

    /// Print the canonical form of an expression
    Crs(CrsArgs),

    /// Period arithmetic
    Period(PeriodArgs),

    /// Inspect and maintain the cache
    Cache(CacheArgs),

    /// Configuration management utilities
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct EvalArgs {
    /// Expression, e.g. "mean(ds(variable='tas',period='1980-1985'))"
    pub expression: String,

    /// Recompute even when cached (results are still cached)
    #[arg(long)]
    pub no_cache: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Echo every command as it runs
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Args, Debug)]
pub struct CrsArgs {
    /// Expression to canonicalize
    pub expression: String,

    /// Also print the CRS hash
    #[arg(long)]
    pub hash: bool,
}

#[derive(Args, Debug)]
pub struct PeriodArgs {
    #[command(subcommand)]
    pub command: PeriodCommands,
}

#[derive(Subcommand, Debug)]
pub enum PeriodCommands {
    /// Show the bounds of a period
    Parse {
        /// Period text, e.g. "1980-1985", "198001_198112", "fx"
        period: String,
    },

    /// Coalesce overlapping or adjacent periods
    Merge {
        /// Periods to merge
        #[arg(required = true)]
        periods: Vec<String>,

        /// Treat Dec-31 → Jan-1 as contiguous (360-day calendars)
        #[arg(long)]
        calendar_360: bool,
    },
}

#[derive(Args, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommands,
}

/// Entry selection shared by listing commands
#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Only CRSs containing this text
    #[arg(long)]
    pub pattern: Option<String>,

    /// Exclude CRSs containing this text
    #[arg(long)]
    pub not_pattern: Option<String>,

    /// Minimum size (e.g., "10MB")
    #[arg(long)]
    pub min_size: Option<String>,

    /// Modified at least this long ago (e.g., "30d", "12h")
    #[arg(long)]
    pub older_than: Option<String>,

    /// Not accessed for at least this long (e.g., "90d")
    #[arg(long)]
    pub unused_for: Option<String>,
}

impl FilterArgs {
    pub fn is_empty(&self) -> bool {
        self.pattern.is_none()
            && self.not_pattern.is_none()
            && self.min_size.is_none()
            && self.older_than.is_none()
            && self.unused_for.is_none()
    }
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// List cached entries
    List {
        #[command(flatten)]
        filter: FilterArgs,

        /// Show paths and timestamps
        #[arg(short, long)]
        verbose: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show disk usage of cached entries
    Du {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Count cached entries
    Count {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Remove matching entries
    Clean {
        #[command(flatten)]
        filter: FilterArgs,

        /// Remove every entry when no filter is given
        #[arg(long)]
        all: bool,

        /// Also remove protected entries
        #[arg(short, long)]
        force: bool,
    },

    /// Remove entries by expression or CRS
    Drop {
        /// Expressions or CRSs
        #[arg(required = true)]
        crs: Vec<String>,

        /// Also remove protected entries
        #[arg(short, long)]
        force: bool,
    },

    /// Write-protect an entry
    Protect {
        /// Expression or CRS
        crs: String,

        /// Lift protection instead
        #[arg(long)]
        stop: bool,
    },

    /// Merge the index with its on-disk snapshot and save it
    Sync {
        /// Rebuild from stamps when the index and the files disagree
        #[arg(long)]
        rebuild_if_inconsistent: bool,
    },

    /// Rebuild the index from the stamps embedded in cached files
    Rebuild,

    /// Remove every cached file
    Reset {
        /// Also remove protected files
        #[arg(short, long)]
        force: bool,
    },

    /// Move an entry to another CRS
    Rename {
        /// Current expression or CRS
        old: String,

        /// New expression or CRS
        new: String,
    },
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validate configuration file
    Validate {
        /// Path to config file
        path: PathBuf,
    },

    /// Show effective configuration
    Show,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_cache_list_filters() {
        let cli = Cli::parse_from([
            "geoflow",
            "--cache-dir",
            "/tmp/c",
            "cache",
            "list",
            "--pattern",
            "regrid",
            "--min-size",
            "1MB",
        ]);
        assert_eq!(cli.common.cache_dir, Some(PathBuf::from("/tmp/c")));
        match cli.command {
            Commands::Cache(CacheArgs {
                command: CacheCommands::List { filter, .. },
            }) => {
                assert_eq!(filter.pattern.as_deref(), Some("regrid"));
                assert_eq!(filter.min_size.as_deref(), Some("1MB"));
                assert!(!filter.is_empty());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_period_merge() {
        let cli = Cli::parse_from(["geoflow", "period", "merge", "1980", "1981", "--calendar-360"]);
        match cli.command {
            Commands::Period(PeriodArgs {
                command: PeriodCommands::Merge { periods, calendar_360 },
            }) => {
                assert_eq!(periods, vec!["1980", "1981"]);
                assert!(calendar_360);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
