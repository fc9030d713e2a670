//! Recursive evaluation of expressions against the cache
//!
//! For every compound node the [`Evaluator`] tries, in order:
//!
//! 1. an exact cache hit on the node's CRS
//! 2. a cached superset: the same computation over a longer period, from
//!    which `select` cuts the requested period
//! 3. a cached prefix: the same computation over the start of the period;
//!    only the remainder is computed and the two are concatenated
//! 4. computing it: operands first, then the operator's command
//!
//! Dataset leaves are handed to operators that select by themselves as raw
//! files, and wrapped in `select` otherwise. Steps 2 and 3 only apply to
//! time-decomposable NetCDF results.

pub mod executor;

mod derived;
mod locator;
mod render;

pub use derived::{DerivedDefinition, DerivedVariables};
pub use executor::{CommandExecutor, CommandLine, ExecError, ExecOutcome, Invocation, ShellExecutor};
pub use locator::{DatasetLocator, DatasetSource, PatternLocator};

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{temp_path, CacheError, CacheStore, PrefixMatch, SupersetMatch};
use crate::expr::{Apply, Dataset, ExprError, Format, Node, OperatorSpec, Registry, GLOBAL, SELECT};
use crate::logging::{operations, services, status};
use render::RenderContext;

#[derive(Error, Debug)]
pub enum EvalError {
    #[error(transparent)]
    Expr(#[from] ExprError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("No data found for {crs}")]
    NoData { crs: String },

    #[error("Derived variables form a cycle: {}", .chain.join(" -> "))]
    DerivationCycle { chain: Vec<String> },

    #[error("Command for {crs} failed with exit code {exit_code}: {command}\n{stderr}")]
    ExternalExecution {
        crs: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Evaluation of {crs} failed: {reason}")]
    InternalEvaluation { crs: String, reason: String },

    #[error("Cannot select domain '{domain}' for {crs}: the select command has no ${{domain}} slot")]
    UnsupportedDomain { domain: String, crs: String },

    #[error("Failed to locate files for {crs}: {reason}")]
    Locate { crs: String, reason: String },
}

/// Result of evaluating a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Evaluated {
    /// A cached artifact
    File(PathBuf),
    /// Raw data files handed to a selecting operator
    Files(Vec<PathBuf>),
    /// One result per ensemble member, in label order
    Ensemble(Vec<(String, Evaluated)>),
}

impl Evaluated {
    /// Every file, depth-first
    pub fn paths(&self) -> Vec<PathBuf> {
        match self {
            Evaluated::File(path) => vec![path.clone()],
            Evaluated::Files(paths) => paths.clone(),
            Evaluated::Ensemble(members) => members
                .iter()
                .flat_map(|(_, member)| member.paths())
                .collect(),
        }
    }

    pub fn labels(&self) -> Vec<String> {
        match self {
            Evaluated::Ensemble(members) => members.iter().map(|(label, _)| label.clone()).collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EvalOptions {
    /// Look results up before computing them. Results are registered either way.
    pub use_cache: bool,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self { use_cache: true }
    }
}

/// Per-call state carried down the recursion
#[derive(Debug, Clone, Default)]
struct Frame {
    /// Derived variables being expanded, outermost first
    deriving: Vec<String>,
    /// Whether the consuming operator selects variable and period itself
    caller_selects: bool,
}

/// An output slot to fill during computation
struct Target {
    output: Option<String>,
    crs: String,
    final_path: PathBuf,
    tmp_path: PathBuf,
}

pub struct Evaluator<'a> {
    cache: &'a mut CacheStore,
    registry: &'a Registry,
    executor: &'a dyn CommandExecutor,
    locator: &'a dyn DatasetLocator,
    derived: &'a DerivedVariables,
    options: EvalOptions,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        cache: &'a mut CacheStore,
        registry: &'a Registry,
        executor: &'a dyn CommandExecutor,
        locator: &'a dyn DatasetLocator,
        derived: &'a DerivedVariables,
    ) -> Self {
        Self {
            cache,
            registry,
            executor,
            locator,
            derived,
            options: EvalOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EvalOptions) -> Self {
        self.options = options;
        self
    }

    /// Evaluate `node`, computing and caching whatever is missing.
    pub fn eval(&mut self, node: &Node) -> Result<Evaluated, EvalError> {
        self.eval_node(node, &Frame::default())
    }

    fn eval_node(&mut self, node: &Node, frame: &Frame) -> Result<Evaluated, EvalError> {
        match node {
            Node::Dataset(dataset) => self.eval_dataset(dataset, frame),
            Node::Apply(apply) => self.eval_apply(node, apply, frame),
            Node::Ensemble(ensemble) => {
                let mut members = Vec::with_capacity(ensemble.members().len());
                for (label, member) in ensemble.members() {
                    members.push((label.clone(), self.eval_node(member, frame)?));
                }
                Ok(Evaluated::Ensemble(members))
            }
        }
    }

    fn eval_dataset(&mut self, dataset: &Dataset, frame: &Frame) -> Result<Evaluated, EvalError> {
        let variable = dataset.variable();
        if self.derived.contains(variable) {
            if frame.deriving.iter().any(|seen| seen == variable) {
                let mut chain = frame.deriving.clone();
                chain.push(variable.to_string());
                return Err(EvalError::DerivationCycle { chain });
            }
            if let Some(expanded) = self.derived.expand(dataset, self.registry)? {
                debug!(variable, crs = %expanded.crs(), "expanding derived variable");
                let mut child = frame.clone();
                child.deriving.push(variable.to_string());
                return self.eval_node(&expanded, &child);
            }
        }

        if frame.caller_selects {
            return self.locate(dataset);
        }

        let select = self.registry.select()?;
        let wrapped = Node::Apply(Apply::new(
            select,
            vec![Node::Dataset(dataset.clone())],
            BTreeMap::new(),
            None,
        )?);
        self.eval_node(&wrapped, frame)
    }

    fn locate(&self, dataset: &Dataset) -> Result<Evaluated, EvalError> {
        let crs = || Node::Dataset(dataset.clone()).crs();
        let files = self
            .locator
            .locate(dataset)
            .map_err(|e| EvalError::Locate {
                crs: crs(),
                reason: format!("{:#}", e),
            })?;
        if files.is_empty() {
            return Err(EvalError::NoData { crs: crs() });
        }
        Ok(Evaluated::Files(files))
    }

    fn eval_apply(&mut self, node: &Node, apply: &Apply, frame: &Frame) -> Result<Evaluated, EvalError> {
        let spec = apply.operator();

        if !spec.is_ensemble_aware() {
            if let Some(Node::Ensemble(ensemble)) = apply.operands().first() {
                let mut members = Vec::with_capacity(ensemble.members().len());
                for (label, member) in ensemble.members() {
                    let mut operands = apply.operands().to_vec();
                    operands[0] = member.clone();
                    let branch = Node::Apply(apply.with_operands(operands));
                    members.push((label.clone(), self.eval_node(&branch, frame)?));
                }
                return Ok(Evaluated::Ensemble(members));
            }
        }

        let crs = node.crs();
        if self.options.use_cache {
            if let Some(path) = self.cache.lookup_exact(&crs) {
                info!(
                    service = services::EVAL,
                    operation = operations::LOOKUP,
                    status = status::HIT,
                    crs = %crs,
                    "cache hit"
                );
                return Ok(Evaluated::File(path));
            }
            if let Some(found) = self.cache.lookup_superset(node, self.registry) {
                return self.extract(node, &crs, found);
            }
            if let Some(found) = self.cache.lookup_prefix(node, self.registry) {
                return self.extend(node, &crs, found, frame);
            }
        }

        self.compute(node, apply, &crs, frame)
    }

    /// Cut the requested period out of a cached superset.
    fn extract(&mut self, node: &Node, crs: &str, found: SupersetMatch) -> Result<Evaluated, EvalError> {
        info!(
            service = services::EVAL,
            operation = operations::LOOKUP,
            status = status::SUPERSET,
            crs,
            superset = %found.crs,
            "reusing cached superset"
        );

        let select = self.registry.select()?;
        let period = node.period();
        let variable = node.variable();
        let domain = node.domain();
        let final_path = self.cache.path_for(crs, Format::NetCdf)?;
        let tmp_path = temp_path(&final_path);

        let inputs = [Evaluated::File(found.path.clone())];
        let outputs = [(None, tmp_path.clone())];
        let context = RenderContext {
            inputs: &inputs,
            outputs: &outputs,
            variable: &variable,
            period: period.as_ref(),
            domain: &domain,
            labels: &[],
            crs,
            apply: None,
        };
        let command = render::render(select.template(), &context).map_err(|slot| {
            EvalError::InternalEvaluation {
                crs: crs.to_string(),
                reason: format!("select command has unfilled slot ${{{}}}", slot),
            }
        })?;

        self.run(select.name(), crs, command, vec![found.path], vec![tmp_path.clone()])?;
        self.cache.register(&tmp_path, crs, &final_path)?;
        self.registered(crs)
    }

    /// Compute the missing tail of a cached prefix and concatenate.
    fn extend(
        &mut self,
        node: &Node,
        crs: &str,
        found: PrefixMatch,
        frame: &Frame,
    ) -> Result<Evaluated, EvalError> {
        info!(
            service = services::EVAL,
            operation = operations::LOOKUP,
            status = status::PREFIX,
            crs,
            prefix = %found.crs,
            suffix = %found.suffix,
            "extending cached prefix"
        );

        let suffix = node.with_period(&found.suffix);
        self.eval_node(&suffix, frame)?;
        let path = self.cache.complement(&found.crs, &suffix.crs(), crs)?;
        Ok(Evaluated::File(path))
    }

    fn compute(&mut self, node: &Node, apply: &Apply, crs: &str, frame: &Frame) -> Result<Evaluated, EvalError> {
        let spec = apply.operator();
        if spec.name() == SELECT {
            check_domain(spec, node, crs)?;
        }

        let child = Frame {
            deriving: frame.deriving.clone(),
            caller_selects: spec.selects() || spec.name() == SELECT,
        };
        let mut inputs = Vec::with_capacity(apply.operands().len());
        for operand in apply.operands() {
            inputs.push(self.eval_node(operand, &child)?);
        }

        let mut targets = Vec::new();
        for output in std::iter::once(None).chain(spec.outputs().iter().cloned().map(Some)) {
            let target_crs = Node::Apply(apply.with_output(output.clone())).crs();
            let final_path = self.cache.path_for(&target_crs, spec.format())?;
            let tmp_path = temp_path(&final_path);
            targets.push(Target {
                output,
                crs: target_crs,
                final_path,
                tmp_path,
            });
        }

        let outputs: Vec<(Option<String>, PathBuf)> = targets
            .iter()
            .map(|target| (target.output.clone(), target.tmp_path.clone()))
            .collect();
        let labels = inputs.iter().map(Evaluated::labels).find(|l| !l.is_empty()).unwrap_or_default();
        let period = node.period();
        let variable = node.variable();
        let domain = node.domain();
        let context = RenderContext {
            inputs: &inputs,
            outputs: &outputs,
            variable: &variable,
            period: period.as_ref(),
            domain: &domain,
            labels: &labels,
            crs,
            apply: Some(apply),
        };
        let command = render::render(spec.template(), &context).map_err(|slot| {
            EvalError::InternalEvaluation {
                crs: crs.to_string(),
                reason: format!("no value for slot ${{{}}} of '{}'", slot, spec.name()),
            }
        })?;

        let input_paths = inputs.iter().flat_map(Evaluated::paths).collect();
        let tmp_paths = targets.iter().map(|target| target.tmp_path.clone()).collect();
        self.run(spec.name(), crs, command, input_paths, tmp_paths)?;

        if let Err(e) = self.register_targets(spec.name(), crs, &targets) {
            for target in &targets {
                let _ = fs::remove_file(&target.tmp_path);
            }
            return Err(e);
        }

        self.registered(crs)
    }

    fn register_targets(
        &mut self,
        label: &str,
        crs: &str,
        targets: &[Target],
    ) -> Result<(), EvalError> {
        for target in targets {
            if !target.tmp_path.exists() {
                if target.crs == crs {
                    return Err(EvalError::InternalEvaluation {
                        crs: crs.to_string(),
                        reason: format!(
                            "'{}' succeeded without producing {}",
                            label,
                            target.tmp_path.display()
                        ),
                    });
                }
                warn!(crs = %target.crs, "secondary output was not produced");
                continue;
            }
            self.cache
                .register(&target.tmp_path, &target.crs, &target.final_path)?;
        }
        Ok(())
    }

    fn run(
        &self,
        label: &str,
        crs: &str,
        command: String,
        inputs: Vec<PathBuf>,
        outputs: Vec<PathBuf>,
    ) -> Result<(), EvalError> {
        info!(
            service = services::EVAL,
            operation = operations::EVALUATE,
            operator = label,
            crs,
            "computing"
        );

        let invocation = Invocation {
            label: label.to_string(),
            command: CommandLine::Shell(command.clone()),
            inputs,
            outputs,
        };
        let failure = match self.executor.execute(&invocation) {
            Ok(outcome) if outcome.success => return Ok(()),
            Ok(outcome) => (outcome.exit_code, outcome.stderr_text()),
            Err(e) => (-1, e.to_string()),
        };

        for output in &invocation.outputs {
            let _ = fs::remove_file(output);
        }
        Err(EvalError::ExternalExecution {
            crs: crs.to_string(),
            command,
            exit_code: failure.0,
            stderr: failure.1,
        })
    }

    fn registered(&mut self, crs: &str) -> Result<Evaluated, EvalError> {
        self.cache
            .lookup_exact(crs)
            .map(Evaluated::File)
            .ok_or_else(|| EvalError::InternalEvaluation {
                crs: crs.to_string(),
                reason: "registered artifact is missing".to_string(),
            })
    }
}

/// A non-global domain needs a select command that can cut it out
fn check_domain(select: &OperatorSpec, node: &Node, crs: &str) -> Result<(), EvalError> {
    if select.template().references("domain") {
        return Ok(());
    }
    match node.datasets().into_iter().find(|dataset| dataset.domain() != GLOBAL) {
        Some(dataset) => Err(EvalError::UnsupportedDomain {
            domain: dataset.domain().to_string(),
            crs: crs.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluated_paths_and_labels() {
        let result = Evaluated::Ensemble(vec![
            ("a".into(), Evaluated::File("/c/a.nc".into())),
            ("b".into(), Evaluated::Files(vec!["/d/b1.nc".into(), "/d/b2.nc".into()])),
        ]);
        assert_eq!(
            result.paths(),
            vec![
                PathBuf::from("/c/a.nc"),
                PathBuf::from("/d/b1.nc"),
                PathBuf::from("/d/b2.nc")
            ]
        );
        assert_eq!(result.labels(), vec!["a".to_string(), "b".to_string()]);
        assert!(Evaluated::File("/c/a.nc".into()).labels().is_empty());
    }

    #[test]
    fn test_cycle_message() {
        let error = EvalError::DerivationCycle {
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(error.to_string(), "Derived variables form a cycle: a -> b -> a");
    }
}
