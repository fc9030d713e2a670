//! Finding the files behind a dataset
//!
//! ```toml
//! [[datasets]]
//! match = { project = "CMIP6" }
//! pattern = "/data/${project}/${model}/${variable}_*.nc"
//! ```
//!
//! The first source whose `match` facets all agree with the dataset and whose
//! pattern can be filled from the dataset's facets is globbed. Files whose
//! stem ends in `_<period>` are kept only when that period overlaps the
//! requested one.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::expr::{Dataset, ExprError, Template};
use crate::period::{intersects, Period};

/// Turns a dataset into base data files (empty = no data)
pub trait DatasetLocator {
    fn locate(&self, dataset: &Dataset) -> Result<Vec<PathBuf>>;
}

/// One `[[datasets]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSource {
    #[serde(rename = "match", default)]
    pub matches: BTreeMap<String, String>,
    pub pattern: String,
}

/// Locator globbing `${facet}` patterns
#[derive(Debug, Clone, Default)]
pub struct PatternLocator {
    sources: Vec<(BTreeMap<String, String>, Template)>,
}

impl PatternLocator {
    pub fn new(sources: &[DatasetSource]) -> Result<Self, ExprError> {
        let sources = sources
            .iter()
            .map(|source| Ok((source.matches.clone(), Template::parse(&source.pattern)?)))
            .collect::<Result<Vec<_>, ExprError>>()?;
        Ok(Self { sources })
    }

    fn pattern_for(&self, dataset: &Dataset) -> Option<String> {
        self.sources.iter().find_map(|(matches, template)| {
            let applies = matches
                .iter()
                .all(|(facet, value)| dataset.facet(facet) == Some(value.as_str()));
            if !applies {
                return None;
            }
            template
                .render(|slot| dataset.facet(slot).map(glob::Pattern::escape))
                .ok()
        })
    }
}

impl DatasetLocator for PatternLocator {
    fn locate(&self, dataset: &Dataset) -> Result<Vec<PathBuf>> {
        let Some(pattern) = self.pattern_for(dataset) else {
            debug!(variable = dataset.variable(), "no dataset source applies");
            return Ok(Vec::new());
        };

        let mut files = Vec::new();
        for entry in glob::glob(&pattern).with_context(|| format!("Invalid pattern: {}", pattern))? {
            let path = entry.with_context(|| format!("Failed to read match of {}", pattern))?;
            if path.is_file() && covers(&path, dataset.period()) {
                files.push(path);
            }
        }
        files.sort();

        debug!(
            variable = dataset.variable(),
            pattern = %pattern,
            file_count = files.len(),
            "located dataset"
        );
        Ok(files)
    }
}

/// Whether the period encoded at the end of the file stem, if any,
/// overlaps `period`
fn covers(path: &Path, period: &Period) -> bool {
    if period.is_fixed() {
        return true;
    }
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    match stem.rsplit('_').next().map(Period::parse) {
        Some(Ok(file_period)) if !file_period.is_fixed() => {
            intersects(&file_period, period).is_some()
        }
        _ => true,
    }
}
