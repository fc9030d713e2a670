//! Expression model
//!
//! Expressions are immutable trees of three node kinds:
//!
//! - [`Dataset`]: a leaf naming stored data by facets plus a [`Period`]
//! - [`Apply`]: an operator applied to ordered operands with parameters
//! - [`Ensemble`]: labelled parallel branches
//!
//! Every node has a canonical string, its CRS, which is the cache key:
//!
//! ```text
//! ds(experiment='historical',model='CNRM-CM6',variable='tas',period='1980-1985')
//! regrid(ds(...),grid='r360x180')
//! regrid.weights(ds(...),grid='r360x180')
//! ens('a':ds(...),'b':ds(...))
//! ```
//!
//! Facets and parameters are written in name order and parameters equal to
//! their declared default are left out, so equal CRS means equal meaning.

mod operator;
mod parser;
mod template;

pub use operator::{Arity, Format, OperatorSpec, Registry, SELECT, SELECT_COMMAND};
pub use template::{shell_quote, Template};

pub(crate) use operator::{classify_slot, SlotKind};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::period::{Period, PeriodError};

/// Facet holding the variable name; every dataset has one
pub const VARIABLE: &str = "variable";
/// Facet holding the spatial domain
pub const DOMAIN: &str = "domain";
/// Domain assumed when a dataset names none
pub const GLOBAL: &str = "global";

#[derive(Error, Debug)]
pub enum ExprError {
    #[error("Unknown operator '{name}'")]
    UnknownOperator { name: String },

    #[error("Operator '{operator}' takes {expected} operand(s), got {found}")]
    Arity {
        operator: String,
        expected: Arity,
        found: usize,
    },

    #[error("Operator '{operator}' has no parameter '{parameter}'")]
    UnknownParameter { operator: String, parameter: String },

    #[error("Invalid operand {position} for '{operator}': {reason}")]
    InvalidOperand {
        operator: String,
        position: usize,
        reason: String,
    },

    #[error("Operator '{operator}' has no output '{output}'")]
    UnknownOutput { operator: String, output: String },

    #[error("Dataset has no 'variable' facet")]
    MissingVariable,

    #[error("Invalid facet '{facet}': {reason}")]
    InvalidFacet { facet: String, reason: String },

    #[error("Ensemble label '{label}' is used twice")]
    DuplicateLabel { label: String },

    #[error("Ensemble has no members")]
    EmptyEnsemble,

    #[error("Invalid name '{name}'")]
    InvalidName { name: String },

    #[error("Invalid template '{template}': {reason}")]
    Template { template: String, reason: String },

    #[error("Macro '{name}': {reason}")]
    Macro { name: String, reason: String },

    #[error("Cannot parse '{input}': {reason}")]
    Parse { input: String, reason: String },

    #[error(transparent)]
    Period(#[from] PeriodError),
}

/// Scalar parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    /// Unquoted text substituted into command templates
    pub fn to_raw(&self) -> String {
        match self {
            ParamValue::Str(value) => value.clone(),
            other => other.to_string(),
        }
    }
}

/// CRS form: strings quoted, floats always carry a `.` or exponent.
impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(value) => write!(f, "{}", value),
            ParamValue::Int(value) => write!(f, "{}", value),
            ParamValue::Float(value) => write!(f, "{:?}", value),
            ParamValue::Str(value) => f.write_str(&quote(value)),
        }
    }
}

pub(crate) fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Stored data identified by facets and a period
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    facets: BTreeMap<String, String>,
    period: Period,
}

impl Dataset {
    pub fn new(facets: BTreeMap<String, String>, period: Period) -> Result<Self, ExprError> {
        for name in facets.keys() {
            if name == "period" {
                return Err(ExprError::InvalidFacet {
                    facet: name.clone(),
                    reason: "the period is given separately".to_string(),
                });
            }
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(ExprError::InvalidFacet {
                    facet: name.clone(),
                    reason: "facet names are alphanumeric".to_string(),
                });
            }
        }
        if !facets.contains_key(VARIABLE) {
            return Err(ExprError::MissingVariable);
        }
        Ok(Self { facets, period })
    }

    pub fn variable(&self) -> &str {
        self.facet(VARIABLE).unwrap_or_default()
    }

    pub fn domain(&self) -> &str {
        self.facet(DOMAIN).unwrap_or(GLOBAL)
    }

    pub fn facet(&self, name: &str) -> Option<&str> {
        self.facets.get(name).map(String::as_str)
    }

    pub fn facets(&self) -> &BTreeMap<String, String> {
        &self.facets
    }

    pub fn period(&self) -> &Period {
        &self.period
    }

    pub fn with_variable(&self, variable: &str) -> Dataset {
        let mut facets = self.facets.clone();
        facets.insert(VARIABLE.to_string(), variable.to_string());
        Dataset {
            facets,
            period: self.period.clone(),
        }
    }

    pub fn with_period(&self, period: Period) -> Dataset {
        Dataset {
            facets: self.facets.clone(),
            period,
        }
    }
}

/// An operator applied to operands
#[derive(Debug, Clone, PartialEq)]
pub struct Apply {
    operator: Arc<OperatorSpec>,
    operands: Vec<Node>,
    params: BTreeMap<String, ParamValue>,
    output: Option<String>,
}

impl Apply {
    /// Validate operands, parameters and output against the operator.
    ///
    /// Parameters equal to the operator's default are dropped.
    pub fn new(
        operator: Arc<OperatorSpec>,
        operands: Vec<Node>,
        params: BTreeMap<String, ParamValue>,
        output: Option<String>,
    ) -> Result<Self, ExprError> {
        let name = operator.name().to_string();

        if !operator.arity().accepts(operands.len()) {
            return Err(ExprError::Arity {
                operator: name,
                expected: operator.arity(),
                found: operands.len(),
            });
        }

        if !operator.is_ensemble_aware() {
            if let Some(position) = operands
                .iter()
                .skip(1)
                .position(|operand| matches!(operand, Node::Ensemble(_)))
            {
                return Err(ExprError::InvalidOperand {
                    operator: name,
                    position: position + 2,
                    reason: "only the first operand may be an ensemble".to_string(),
                });
            }
        }

        if let Some(parameter) = params.keys().find(|key| !operator.declares(key)) {
            return Err(ExprError::UnknownParameter {
                operator: name,
                parameter: parameter.clone(),
            });
        }

        if let Some(output) = &output {
            if !operator.outputs().contains(output) {
                return Err(ExprError::UnknownOutput {
                    operator: name,
                    output: output.clone(),
                });
            }
        }

        let params = params
            .into_iter()
            .filter(|(key, value)| operator.param_default(key) != Some(value))
            .collect();

        Ok(Self {
            operator,
            operands,
            params,
            output,
        })
    }

    pub fn operator(&self) -> &Arc<OperatorSpec> {
        &self.operator
    }

    pub fn operands(&self) -> &[Node] {
        &self.operands
    }

    /// Explicitly supplied, non-default parameters
    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    /// Supplied value, falling back to the declared default
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params
            .get(name)
            .or_else(|| self.operator.param_default(name))
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    /// Same application over different operands of the same kinds
    pub fn with_operands(&self, operands: Vec<Node>) -> Apply {
        Apply {
            operator: Arc::clone(&self.operator),
            operands,
            params: self.params.clone(),
            output: self.output.clone(),
        }
    }

    /// Same application selecting another output (`None` = main output)
    pub fn with_output(&self, output: Option<String>) -> Apply {
        Apply {
            output,
            ..self.clone()
        }
    }
}

/// Labelled parallel branches
#[derive(Debug, Clone, PartialEq)]
pub struct Ensemble {
    members: Vec<(String, Node)>,
}

impl Ensemble {
    pub fn new(members: Vec<(String, Node)>) -> Result<Self, ExprError> {
        if members.is_empty() {
            return Err(ExprError::EmptyEnsemble);
        }
        let mut seen = BTreeSet::new();
        for (label, _) in &members {
            if !seen.insert(label.as_str()) {
                return Err(ExprError::DuplicateLabel {
                    label: label.clone(),
                });
            }
        }
        Ok(Self { members })
    }

    pub fn members(&self) -> &[(String, Node)] {
        &self.members
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|(label, _)| label.as_str())
    }
}

/// Expression tree node
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Dataset(Dataset),
    Apply(Apply),
    Ensemble(Ensemble),
}

impl Node {
    /// Canonical representation string
    pub fn crs(&self) -> String {
        let mut out = String::new();
        self.write_crs(&mut out, false);
        out
    }

    /// CRS with every time-dependent period replaced by `*`; `fx` stays
    pub fn masked_crs(&self) -> String {
        let mut out = String::new();
        self.write_crs(&mut out, true);
        out
    }

    fn write_crs(&self, out: &mut String, masked: bool) {
        match self {
            Node::Dataset(dataset) => {
                out.push_str("ds(");
                for (name, value) in &dataset.facets {
                    out.push_str(name);
                    out.push('=');
                    out.push_str(&quote(value));
                    out.push(',');
                }
                out.push_str("period=");
                if masked && !dataset.period.is_fixed() {
                    out.push_str("'*'");
                } else {
                    out.push_str(&quote(dataset.period.label()));
                }
                out.push(')');
            }
            Node::Apply(apply) => {
                out.push_str(&self.operator_prefix());
                let mut first = true;
                for operand in &apply.operands {
                    if !first {
                        out.push(',');
                    }
                    first = false;
                    operand.write_crs(out, masked);
                }
                for (name, value) in &apply.params {
                    if !first {
                        out.push(',');
                    }
                    first = false;
                    out.push_str(name);
                    out.push('=');
                    out.push_str(&value.to_string());
                }
                out.push(')');
            }
            Node::Ensemble(ensemble) => {
                out.push_str("ens(");
                for (index, (label, member)) in ensemble.members.iter().enumerate() {
                    if index > 0 {
                        out.push(',');
                    }
                    out.push_str(&quote(label));
                    out.push(':');
                    member.write_crs(out, masked);
                }
                out.push(')');
            }
        }
    }

    /// Leading CRS text shared by every node with the same head,
    /// e.g. `regrid(` or `regrid.weights(`
    pub fn operator_prefix(&self) -> String {
        match self {
            Node::Dataset(_) => "ds(".to_string(),
            Node::Ensemble(_) => "ens(".to_string(),
            Node::Apply(apply) => match &apply.output {
                Some(output) => format!("{}.{}(", apply.operator.name(), output),
                None => format!("{}(", apply.operator.name()),
            },
        }
    }

    /// Variable name carried by the result
    pub fn variable(&self) -> String {
        match self {
            Node::Dataset(dataset) => dataset.variable().to_string(),
            Node::Apply(apply) => {
                let input = apply
                    .operands
                    .first()
                    .map(Node::variable)
                    .unwrap_or_else(|| apply.operator.name().to_string());
                apply.operator.output_variable(&input)
            }
            Node::Ensemble(ensemble) => ensemble
                .members
                .first()
                .map(|(_, member)| member.variable())
                .unwrap_or_default(),
        }
    }

    /// Domain of the first dataset leaf
    pub fn domain(&self) -> String {
        self.datasets()
            .first()
            .map(|dataset| dataset.domain().to_string())
            .unwrap_or_else(|| GLOBAL.to_string())
    }

    /// Period shared by all time-dependent leaves.
    ///
    /// `Fixed` when every leaf is fixed, `None` for ensembles or when the
    /// leaves disagree.
    pub fn period(&self) -> Option<Period> {
        if matches!(self, Node::Ensemble(_)) {
            return None;
        }
        let mut common: Option<&Period> = None;
        for dataset in self.datasets() {
            if dataset.period.is_fixed() {
                continue;
            }
            match common {
                None => common = Some(&dataset.period),
                Some(period) if period == &dataset.period => {}
                Some(_) => return None,
            }
        }
        Some(common.cloned().unwrap_or(Period::Fixed))
    }

    /// Copy of the tree with every time-dependent leaf moved to `period`
    pub fn with_period(&self, period: &Period) -> Node {
        match self {
            Node::Dataset(dataset) if dataset.period.is_fixed() => self.clone(),
            Node::Dataset(dataset) => Node::Dataset(dataset.with_period(period.clone())),
            Node::Apply(apply) => Node::Apply(
                apply.with_operands(
                    apply
                        .operands
                        .iter()
                        .map(|operand| operand.with_period(period))
                        .collect(),
                ),
            ),
            Node::Ensemble(ensemble) => Node::Ensemble(Ensemble {
                members: ensemble
                    .members
                    .iter()
                    .map(|(label, member)| (label.clone(), member.with_period(period)))
                    .collect(),
            }),
        }
    }

    /// Whether the result over a period equals the concatenation of the
    /// results over its sub-periods
    pub fn is_time_decomposable(&self) -> bool {
        match self {
            Node::Dataset(_) => true,
            Node::Apply(apply) => {
                apply.operator.is_timewise()
                    && apply.operands.iter().all(Node::is_time_decomposable)
            }
            Node::Ensemble(_) => false,
        }
    }

    /// Whether superset/prefix reuse applies: a time-decomposable NetCDF
    /// application over a common, non-fixed period
    pub fn is_period_reusable(&self) -> bool {
        matches!(self, Node::Apply(_))
            && self.format() == Format::NetCdf
            && self.is_time_decomposable()
            && matches!(self.period(), Some(Period::Span(_)))
    }

    pub fn format(&self) -> Format {
        match self {
            Node::Dataset(_) => Format::NetCdf,
            Node::Apply(apply) => apply.operator.format(),
            Node::Ensemble(ensemble) => ensemble
                .members
                .first()
                .map(|(_, member)| member.format())
                .unwrap_or_default(),
        }
    }

    /// Dataset leaves in depth-first order
    pub fn datasets(&self) -> Vec<&Dataset> {
        let mut out = Vec::new();
        self.collect_datasets(&mut out);
        out
    }

    fn collect_datasets<'a>(&'a self, out: &mut Vec<&'a Dataset>) {
        match self {
            Node::Dataset(dataset) => out.push(dataset),
            Node::Apply(apply) => apply
                .operands
                .iter()
                .for_each(|operand| operand.collect_datasets(out)),
            Node::Ensemble(ensemble) => ensemble
                .members
                .iter()
                .for_each(|(_, member)| member.collect_datasets(out)),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.crs())
    }
}
