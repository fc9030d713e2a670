// Common test utilities shared across acceptance tests
//
// ## Test Isolation Strategy
//
// Each test builds its own cache root and data directory inside a TempDir,
// so nothing is shared between tests or with a real cache under ~/.cache.
//
// External tools are replaced by in-process fakes:
// - FakeExecutor writes every declared output file and records what ran
// - FakeLocator serves one data file per known variable
// - FakeStamper appends the CRS as a trailer line and reads it back
//
// When TestEnv is dropped the TempDir goes with it.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use geoflow::cache::{CacheError, CacheOptions, CacheStore, Stamp, StampPolicy, Stamper};
use geoflow::eval::{
    CommandExecutor, DatasetLocator, DerivedDefinition, DerivedVariables, EvalOptions, ExecError,
    ExecOutcome, Invocation,
};
use geoflow::expr::{Dataset, Format, OperatorSpec, ParamValue};
use geoflow::{EvalError, Evaluated, Evaluator, Node, Registry};

const STAMP_PREFIX: &str = "#crs=";

/// Executor that fakes every command by writing its outputs
#[derive(Default)]
pub struct FakeExecutor {
    log: Mutex<Vec<Invocation>>,
    failing: Mutex<Option<String>>,
}

impl FakeExecutor {
    /// Labels of the commands run so far, in order
    pub fn labels(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .map(|invocation| invocation.label.clone())
            .collect()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap().clear();
    }

    /// Make commands labelled `label` exit with code 1
    pub fn fail_on(&self, label: &str) {
        *self.failing.lock().unwrap() = Some(label.to_string());
    }
}

impl CommandExecutor for FakeExecutor {
    fn execute(&self, invocation: &Invocation) -> Result<ExecOutcome, ExecError> {
        self.log.lock().unwrap().push(invocation.clone());

        let failing = self.failing.lock().unwrap().clone();
        if failing.as_deref() == Some(invocation.label.as_str()) {
            return Ok(ExecOutcome {
                success: false,
                exit_code: 1,
                duration: Duration::ZERO,
                stdout: Vec::new(),
                stderr: b"boom".to_vec(),
            });
        }

        // Concatenation keeps both inputs, anything else writes its label
        let content = if invocation.label == "concat" {
            invocation
                .inputs
                .iter()
                .map(|input| fs::read_to_string(input).unwrap())
                .collect::<String>()
        } else {
            format!("{}\n", invocation.label)
        };
        for output in &invocation.outputs {
            fs::write(output, &content).unwrap();
        }

        Ok(ExecOutcome {
            success: true,
            exit_code: 0,
            duration: Duration::ZERO,
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

/// Serves `<dir>/<variable>.nc` for every known variable
pub struct FakeLocator {
    dir: PathBuf,
    variables: BTreeSet<String>,
}

impl FakeLocator {
    pub fn new(dir: &Path, variables: &[&str]) -> Self {
        fs::create_dir_all(dir).unwrap();
        for variable in variables {
            fs::write(dir.join(format!("{}.nc", variable)), format!("{}\n", variable)).unwrap();
        }
        Self {
            dir: dir.to_path_buf(),
            variables: variables.iter().map(|v| v.to_string()).collect(),
        }
    }
}

impl DatasetLocator for FakeLocator {
    fn locate(&self, dataset: &Dataset) -> anyhow::Result<Vec<PathBuf>> {
        if !self.variables.contains(dataset.variable()) {
            return Ok(Vec::new());
        }
        Ok(vec![self.dir.join(format!("{}.nc", dataset.variable()))])
    }
}

/// Keeps the CRS in a trailer line; the last trailer wins
pub struct FakeStamper;

impl Stamper for FakeStamper {
    fn stamp(&self, path: &Path, _format: Format, crs: &str) -> Result<(), CacheError> {
        let mut content = fs::read_to_string(path).unwrap_or_default();
        content.push_str(&format!("{}{}\n", STAMP_PREFIX, crs));
        fs::write(path, content).map_err(|e| CacheError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn read(&self, path: &Path, _format: Format) -> Result<Option<Stamp>, CacheError> {
        let content = fs::read_to_string(path).map_err(|e| CacheError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(content
            .lines()
            .filter_map(|line| line.strip_prefix(STAMP_PREFIX))
            .last()
            .map(|crs| Stamp {
                crs: crs.to_string(),
                version: "test".to_string(),
            }))
    }
}

/// Operators used throughout the acceptance tests
pub fn test_registry() -> Registry {
    let mut registry = Registry::with_builtins().unwrap();
    registry
        .register(
            OperatorSpec::new("regrid", "cdo remap${method},${grid} ${in} ${out}")
                .unwrap()
                .with_default("method", ParamValue::Str("bil".into()))
                .unwrap()
                .with_timewise(true),
        )
        .unwrap();
    registry
        .register(OperatorSpec::new("mean", "cdo timmean ${in} ${out}").unwrap())
        .unwrap();
    registry
        .register(
            OperatorSpec::new("minus", "cdo sub ${in_1} ${in_2} ${out}")
                .unwrap()
                .with_timewise(true),
        )
        .unwrap();
    registry
        .register(
            OperatorSpec::new("ensmean", "cdo ensmean ${ins} ${out} # ${labels}")
                .unwrap()
                .with_ensemble_aware(true),
        )
        .unwrap();
    registry
        .register(
            OperatorSpec::new("plot", "ncl ${in} ${out} ${out_legend}")
                .unwrap()
                .with_format(Format::Png),
        )
        .unwrap();
    registry
}

/// Isolated cache root, data directory and fakes
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub cache_dir: PathBuf,
    pub registry: Registry,
    pub executor: Arc<FakeExecutor>,
    pub locator: FakeLocator,
    pub derived: DerivedVariables,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let cache_dir = temp_dir.path().join("cache");
        let locator = FakeLocator::new(&temp_dir.path().join("data"), &["tas", "pr"]);
        Self {
            temp_dir,
            cache_dir,
            registry: test_registry(),
            executor: Arc::new(FakeExecutor::default()),
            locator,
            derived: DerivedVariables::default(),
        }
    }

    pub fn with_derived(mut self, definitions: Vec<DerivedDefinition>) -> Self {
        self.derived = DerivedVariables::new(definitions);
        self
    }

    pub fn options(&self) -> CacheOptions {
        let mut options = CacheOptions::new(&self.cache_dir);
        options.stamping = StampPolicy::Mandatory;
        options
    }

    pub fn open_cache(&self) -> CacheStore {
        let executor: Arc<dyn CommandExecutor> = self.executor.clone();
        CacheStore::open_with_stamper(self.options(), executor, Box::new(FakeStamper)).unwrap()
    }

    pub fn parse(&self, text: &str) -> Node {
        self.registry.parse(text).unwrap()
    }

    pub fn crs(&self, text: &str) -> String {
        self.parse(text).crs()
    }

    pub fn eval(&self, cache: &mut CacheStore, text: &str) -> Result<Evaluated, EvalError> {
        self.eval_with(cache, text, EvalOptions::default())
    }

    pub fn eval_with(
        &self,
        cache: &mut CacheStore,
        text: &str,
        options: EvalOptions,
    ) -> Result<Evaluated, EvalError> {
        let node = self.parse(text);
        Evaluator::new(
            cache,
            &self.registry,
            self.executor.as_ref(),
            &self.locator,
            &self.derived,
        )
        .with_options(options)
        .eval(&node)
    }

    /// Write a stand-in temp artifact and register it under `crs`
    pub fn put(&self, cache: &mut CacheStore, crs: &str) -> PathBuf {
        let path = cache.path_for(crs, Format::NetCdf).unwrap();
        let tmp = self.temp_dir.path().join("artifact.tmp");
        fs::write(&tmp, format!("{}\n", crs)).unwrap();
        cache.register(&tmp, crs, &path).unwrap();
        path
    }
}
