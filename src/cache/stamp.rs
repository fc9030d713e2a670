//! Artifact stamping
//!
//! Each artifact carries the CRS that produced it plus a version tag, so the
//! index can be rebuilt from the files alone:
//!
//! | Format    | Write                  | Read                   | Fields                    |
//! |-----------|------------------------|------------------------|---------------------------|
//! | NetCDF    | `ncatted`              | `ncdump -h`            | `CRS_def`, `CRS_version`  |
//! | PNG       | `convert -set`         | `identify -format`     | `CRS_def`, `CRS_version`  |
//! | PDF / EPS | `exiftool`             | `exiftool -s3`         | `Title`, `Creator`        |
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use super::CacheError;
use crate::eval::executor::{CommandExecutor, CommandLine, ExecOutcome, Invocation};
use crate::expr::Format;

pub const CRS_ATTRIBUTE: &str = "CRS_def";
pub const VERSION_ATTRIBUTE: &str = "CRS_version";

/// Tag written next to the CRS
pub fn version_tag() -> String {
    format!("geoflow {}", env!("CARGO_PKG_VERSION"))
}

/// What to do when an artifact cannot be stamped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StampPolicy {
    /// Fail the registration
    Mandatory,
    /// Warn and keep the artifact unstamped
    #[default]
    BestEffort,
    /// Never stamp
    Disabled,
}

impl std::str::FromStr for StampPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "mandatory" => Ok(Self::Mandatory),
            "best-effort" => Ok(Self::BestEffort),
            "disabled" => Ok(Self::Disabled),
            _ => anyhow::bail!(
                "Invalid stamping policy: {}. Must be mandatory, best-effort, or disabled",
                s
            ),
        }
    }
}

impl StampPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mandatory => "mandatory",
            Self::BestEffort => "best-effort",
            Self::Disabled => "disabled",
        }
    }
}

/// Metadata embedded in an artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    pub crs: String,
    pub version: String,
}

/// Embeds and reads back stamps
pub trait Stamper: Send + Sync {
    fn stamp(&self, path: &Path, format: Format, crs: &str) -> Result<(), CacheError>;

    /// `Ok(None)` when the file carries no stamp
    fn read(&self, path: &Path, format: Format) -> Result<Option<Stamp>, CacheError>;
}

/// Stamper driving the standard metadata tools through an executor
pub struct ToolStamper {
    executor: Arc<dyn CommandExecutor>,
    version: String,
}

impl ToolStamper {
    pub fn new(executor: Arc<dyn CommandExecutor>, version: String) -> Self {
        Self { executor, version }
    }

    fn run(&self, path: &Path, argv: Vec<String>) -> Result<ExecOutcome, CacheError> {
        let tool = argv.first().cloned().unwrap_or_default();
        let failed = |reason: String| CacheError::StampingFailed {
            path: path.to_path_buf(),
            reason,
        };

        which::which(&tool).map_err(|_| failed(format!("'{}' not found in PATH", tool)))?;

        let invocation = Invocation {
            label: tool.clone(),
            command: CommandLine::Argv(argv),
            inputs: vec![path.to_path_buf()],
            outputs: vec![],
        };
        let outcome = self
            .executor
            .execute(&invocation)
            .map_err(|e| failed(e.to_string()))?;

        if !outcome.success {
            return Err(failed(format!(
                "{} exited with code {}: {}",
                tool,
                outcome.exit_code,
                outcome.stderr_text().trim()
            )));
        }
        Ok(outcome)
    }
}

impl Stamper for ToolStamper {
    fn stamp(&self, path: &Path, format: Format, crs: &str) -> Result<(), CacheError> {
        self.run(path, stamp_command(format, path, crs, &self.version))
            .map(|_| ())
    }

    fn read(&self, path: &Path, format: Format) -> Result<Option<Stamp>, CacheError> {
        let outcome = self.run(path, read_command(format, path))?;
        Ok(parse_read_output(format, &outcome.stdout_text()))
    }
}

/// Argument vector that embeds `crs` and `version` into `path`
pub fn stamp_command(format: Format, path: &Path, crs: &str, version: &str) -> Vec<String> {
    let path = path.display().to_string();
    match format {
        Format::NetCdf => vec![
            "ncatted".to_string(),
            "-h".to_string(),
            "-a".to_string(),
            format!("{},global,o,c,{}", CRS_ATTRIBUTE, crs),
            "-a".to_string(),
            format!("{},global,o,c,{}", VERSION_ATTRIBUTE, version),
            path,
        ],
        Format::Png => vec![
            "convert".to_string(),
            path.clone(),
            "-set".to_string(),
            CRS_ATTRIBUTE.to_string(),
            crs.to_string(),
            "-set".to_string(),
            VERSION_ATTRIBUTE.to_string(),
            version.to_string(),
            path,
        ],
        Format::Pdf | Format::Eps => vec![
            "exiftool".to_string(),
            "-overwrite_original".to_string(),
            format!("-Title={}", crs),
            format!("-Creator={}", version),
            path,
        ],
    }
}

/// Argument vector that prints the stamp of `path`
pub fn read_command(format: Format, path: &Path) -> Vec<String> {
    let path = path.display().to_string();
    match format {
        Format::NetCdf => vec!["ncdump".to_string(), "-h".to_string(), path],
        Format::Png => vec![
            "identify".to_string(),
            "-format".to_string(),
            format!("%[{}]\\n%[{}]", CRS_ATTRIBUTE, VERSION_ATTRIBUTE),
            path,
        ],
        Format::Pdf | Format::Eps => vec![
            "exiftool".to_string(),
            "-s3".to_string(),
            "-Title".to_string(),
            "-Creator".to_string(),
            path,
        ],
    }
}

pub fn parse_read_output(format: Format, output: &str) -> Option<Stamp> {
    match format {
        Format::NetCdf => {
            let crs = ncdump_attribute(output, CRS_ATTRIBUTE)?;
            let version = ncdump_attribute(output, VERSION_ATTRIBUTE).unwrap_or_default();
            Some(Stamp { crs, version })
        }
        Format::Png | Format::Pdf | Format::Eps => {
            let mut lines = output.lines().map(str::trim);
            let crs = lines.next().filter(|line| !line.is_empty())?.to_string();
            let version = lines.next().unwrap_or_default().to_string();
            Some(Stamp { crs, version })
        }
    }
}

/// Value of a global string attribute in `ncdump -h` output
fn ncdump_attribute(output: &str, name: &str) -> Option<String> {
    let key = format!(":{} = \"", name);
    output.lines().find_map(|line| {
        let start = line.find(&key)? + key.len();
        let rest = &line[start..];
        let end = rest.rfind('"')?;
        Some(unescape_cdl(&rest[..end]))
    })
}

fn unescape_cdl(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}
