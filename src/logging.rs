//! Structured logging utilities for geoflow
//!
//! Every event carries structured fields so runs can be grepped or fed to a
//! log pipeline.
//!
//! # Log Format Conventions
//!
//! - `service`: the subsystem ("cache", "eval")
//! - `operation`: what is being done ("lookup", "register", "sync", ...)
//! - `status`: how it went ("hit", "superset", "prefix", "success", "error")
//! - `crs`: canonical expression string of the node involved
//! - `path`: artifact path
//!
//! # Examples
//!
//! ```rust,ignore
//! use tracing::info;
//!
//! info!(
//!     service = "cache",
//!     operation = "lookup",
//!     status = "hit",
//!     crs = %crs,
//!     "cache hit"
//! );
//! ```

use std::{fmt as std_fmt, io};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    fmt::{self, format::Writer},
    prelude::*,
    EnvFilter,
};

/// Shows "geoflow" instead of the module path
struct GeoflowFormatter {
    with_ansi: bool,
}

impl<S, N> FormatEvent<S, N> for GeoflowFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std_fmt::Result {
        let meta = event.metadata();

        write!(
            writer,
            "{} ",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f")
        )?;

        if self.with_ansi {
            let level_style = match *meta.level() {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                tracing::Level::DEBUG => "\x1b[34m",
                tracing::Level::TRACE => "\x1b[35m",
            };
            write!(writer, "{}{:5}(geoflow)\x1b[0m: ", level_style, meta.level())?;
        } else {
            write!(writer, "{:5}(geoflow): ", meta.level())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, colored
    Pretty,
    /// Plain single line (CI)
    Compact,
    /// JSON lines for log aggregation
    Json,
}

impl LogFormat {
    /// Parse from `GEOFLOW_LOG_FORMAT`, defaulting to compact under `CI`
    pub fn from_env() -> Self {
        Self::parse(
            &std::env::var("GEOFLOW_LOG_FORMAT").unwrap_or_default(),
            std::env::var("CI").is_ok(),
        )
    }

    fn parse(value: &str, ci: bool) -> Self {
        match value.to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            "pretty" => Self::Pretty,
            _ if ci => Self::Compact,
            _ => Self::Pretty,
        }
    }
}

/// Initialize the global tracing subscriber, writing to stderr
///
/// # Environment Variables
///
/// - `RUST_LOG`: log level (e.g. "debug", "geoflow=trace"), default "info"
/// - `GEOFLOW_LOG_FORMAT`: "pretty", "compact" or "json"
/// - `CI`: if set, defaults to compact
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match LogFormat::from_env() {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .event_format(GeoflowFormatter { with_ansi: true })
                        .with_writer(io::stderr),
                )
                .init();
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .event_format(GeoflowFormatter { with_ansi: false })
                        .with_writer(io::stderr),
                )
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_file(false)
                        .with_line_number(false)
                        .with_ansi(false)
                        .with_writer(io::stderr)
                        .json(),
                )
                .init();
        }
    }
}

/// Standard field names for consistent logging
#[allow(dead_code)]
pub mod fields {
    pub const SERVICE: &str = "service";
    pub const OPERATION: &str = "operation";
    pub const STATUS: &str = "status";
    /// Canonical expression string
    pub const CRS: &str = "crs";
    /// Artifact path
    pub const PATH: &str = "path";
    /// Rendered command line
    pub const COMMAND: &str = "command";
    pub const ENTRY_COUNT: &str = "entry_count";
}

/// Service names for consistent logging
#[allow(dead_code)]
pub mod services {
    pub const CACHE: &str = "cache";
    pub const EVAL: &str = "eval";
}

/// Operation names for consistent logging
#[allow(dead_code)]
pub mod operations {
    pub const LOAD: &str = "load";
    pub const LOOKUP: &str = "lookup";
    pub const REGISTER: &str = "register";
    pub const STAMP: &str = "stamp";
    pub const DROP: &str = "drop";
    pub const PROTECT: &str = "protect";
    pub const RENAME: &str = "rename";
    pub const COMPLEMENT: &str = "complement";
    pub const SYNC: &str = "sync";
    pub const REBUILD: &str = "rebuild";
    pub const RESET: &str = "reset";
    pub const EVALUATE: &str = "evaluate";
    pub const EXECUTE: &str = "execute";
}

/// Status values for consistent logging
#[allow(dead_code)]
pub mod status {
    pub const SUCCESS: &str = "success";
    pub const ERROR: &str = "error";
    pub const HIT: &str = "hit";
    pub const MISS: &str = "miss";
    pub const SUPERSET: &str = "superset";
    pub const PREFIX: &str = "prefix";
    pub const PRUNED: &str = "pruned";
}
