use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache::{default_cache_dir, version_tag, CacheOptions, Layout, StampPolicy, DEFAULT_CONCAT_COMMAND};
use crate::eval::{DatasetSource, DerivedDefinition, DerivedVariables, PatternLocator};
use crate::expr::{Format, OperatorSpec, ParamValue, Registry};

/// Complete geoflow configuration (loaded from `geoflow.toml`)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeoflowConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    /// External operators
    #[serde(default)]
    pub operators: Vec<OperatorConfig>,

    /// Where base data lives
    #[serde(default)]
    pub datasets: Vec<DatasetSource>,

    /// Variables computed from other variables
    #[serde(default)]
    pub derived: Vec<DerivedDefinition>,

    /// Expression macros: name = body using ARG / ARG1..N
    #[serde(default)]
    pub macros: BTreeMap<String, String>,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache directory path (defaults to the platform cache dir)
    #[serde(default)]
    pub dir: Option<String>,

    /// Hex characters of the CRS hash used in file names
    #[serde(default = "default_hash_length")]
    pub hash_length: usize,

    /// Number of shard directory levels
    #[serde(default = "default_shard_depth")]
    pub shard_depth: usize,

    /// Hash characters per shard directory
    #[serde(default = "default_shard_width")]
    pub shard_width: usize,

    /// Stamping policy: mandatory, best-effort, disabled
    #[serde(default = "default_stamping")]
    pub stamping: String,

    /// Command joining two consecutive periods (`${ins}`, `${out}`)
    #[serde(default = "default_concat_command")]
    pub concat_command: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            hash_length: default_hash_length(),
            shard_depth: default_shard_depth(),
            shard_width: default_shard_width(),
            stamping: default_stamping(),
            concat_command: default_concat_command(),
        }
    }
}

/// One `[[operators]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub name: String,

    /// Command template, e.g. `cdo timmean ${in} ${out}`
    pub command: String,

    /// Output format: nc, png, pdf, eps
    #[serde(default)]
    pub format: Format,

    /// Selects variable, period and domain from raw files itself
    #[serde(default)]
    pub selects: bool,

    /// Result over a period is the concatenation of results over sub-periods
    #[serde(default)]
    pub timewise: bool,

    /// Consumes ensembles whole instead of member by member
    #[serde(default)]
    pub ensemble_aware: bool,

    /// Output variable name, e.g. `${var}_anom`
    #[serde(default)]
    pub output_var: Option<String>,

    /// Parameter defaults
    #[serde(default)]
    pub defaults: BTreeMap<String, ParamValue>,
}

fn default_hash_length() -> usize {
    Layout::default().hash_length
}

fn default_shard_depth() -> usize {
    Layout::default().shard_depth
}

fn default_shard_width() -> usize {
    Layout::default().shard_width
}

fn default_stamping() -> String {
    StampPolicy::default().as_str().to_string()
}

fn default_concat_command() -> String {
    DEFAULT_CONCAT_COMMAND.to_string()
}

impl GeoflowConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: GeoflowConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.cache
            .stamping
            .parse::<StampPolicy>()
            .context("Invalid cache.stamping")?;

        if let Err(reason) = self.layout().validate() {
            anyhow::bail!("Invalid cache layout: {}", reason);
        }

        let mut seen = BTreeSet::new();
        for operator in &self.operators {
            if !seen.insert(operator.name.as_str()) {
                anyhow::bail!("Operator '{}' is declared twice", operator.name);
            }
        }

        let registry = self.registry()?;
        for derived in &self.derived {
            if !registry.contains(&derived.operator) {
                anyhow::bail!(
                    "Derived variable '{}' uses unknown operator '{}'",
                    derived.variable,
                    derived.operator
                );
            }
            if derived.inputs.is_empty() {
                anyhow::bail!("Derived variable '{}' has no inputs", derived.variable);
            }
        }

        self.locator()?;
        Ok(())
    }

    fn layout(&self) -> Layout {
        Layout {
            hash_length: self.cache.hash_length,
            shard_depth: self.cache.shard_depth,
            shard_width: self.cache.shard_width,
        }
    }

    /// Built-in `select` plus the declared operators and macros
    pub fn registry(&self) -> Result<Registry> {
        let mut registry = Registry::with_builtins().context("Failed to create registry")?;

        for operator in &self.operators {
            let spec = operator_spec(operator)
                .with_context(|| format!("Invalid operator '{}'", operator.name))?;
            registry.register(spec)?;
        }

        for (name, body) in &self.macros {
            registry
                .define_macro(name, body)
                .with_context(|| format!("Invalid macro '{}'", name))?;
        }

        Ok(registry)
    }

    /// Cache directory: `override_dir`, then `cache.dir`, then the platform default
    pub fn cache_dir(&self, override_dir: Option<&Path>) -> PathBuf {
        override_dir
            .map(Path::to_path_buf)
            .or_else(|| self.cache.dir.as_ref().map(PathBuf::from))
            .unwrap_or_else(default_cache_dir)
    }

    pub fn cache_options(&self, override_dir: Option<&Path>) -> Result<CacheOptions> {
        Ok(CacheOptions {
            root: self.cache_dir(override_dir),
            layout: self.layout(),
            stamping: self.cache.stamping.parse().context("Invalid cache.stamping")?,
            concat_command: self.cache.concat_command.clone(),
            version: version_tag(),
        })
    }

    pub fn locator(&self) -> Result<PatternLocator> {
        PatternLocator::new(&self.datasets).context("Invalid dataset pattern")
    }

    pub fn derived_variables(&self) -> DerivedVariables {
        DerivedVariables::new(self.derived.iter().cloned())
    }
}

fn operator_spec(config: &OperatorConfig) -> Result<OperatorSpec> {
    let mut spec = OperatorSpec::new(&config.name, &config.command)?
        .with_format(config.format)
        .with_selects(config.selects || config.name == crate::expr::SELECT)
        .with_timewise(config.timewise);
    if config.ensemble_aware {
        spec = spec.with_ensemble_aware(true);
    }
    if let Some(output_var) = &config.output_var {
        spec = spec.with_output_var(output_var)?;
    }
    for (param, value) in &config.defaults {
        spec = spec.with_default(param, value.clone())?;
    }
    Ok(spec)
}
