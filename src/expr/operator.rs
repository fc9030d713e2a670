//! Operator declarations and the registry that resolves names to them

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use super::parser::{self, Macro};
use super::{ExprError, Node, ParamValue, Template};

/// Name of the built-in time/variable selection operator
pub const SELECT: &str = "select";

/// Default command behind [`SELECT`]
pub const SELECT_COMMAND: &str =
    "cdo -O selname,${var} -seldate,${period_iso} -mergetime ${ins} ${out}";

/// Names the expression grammar keeps for itself
const RESERVED_NAMES: &[&str] = &["ds", "ens"];

/// Template slots filled by the evaluator rather than by parameters
const CONTEXT_SLOTS: &[&str] = &["var", "period", "period_iso", "domain", "labels", "crs"];

/// Artifact format produced by an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    #[serde(rename = "nc")]
    NetCdf,
    Png,
    Pdf,
    Eps,
}

impl Format {
    pub fn extension(&self) -> &'static str {
        match self {
            Format::NetCdf => "nc",
            Format::Png => "png",
            Format::Pdf => "pdf",
            Format::Eps => "eps",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "nc" => Some(Format::NetCdf),
            "png" => Some(Format::Png),
            "pdf" => Some(Format::Pdf),
            "eps" => Some(Format::Eps),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Accepted operand count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: Option<usize>,
}

impl Arity {
    pub fn accepts(&self, count: usize) -> bool {
        count >= self.min && self.max.map_or(true, |max| count <= max)
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) if max == self.min => write!(f, "exactly {}", max),
            Some(max) => write!(f, "{} to {}", self.min, max),
            None => write!(f, "at least {}", self.min),
        }
    }
}

/// What a template slot stands for
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SlotKind {
    /// `${in}` / `${in_N}`: the N-th operand (1-based)
    Input(usize),
    /// `${ins}` / `${ins_N}`: operands from the N-th on
    Inputs(usize),
    /// `${out}` / `${out_NAME}`
    Output(Option<String>),
    Context,
    Param,
}

pub(crate) fn classify_slot(name: &str) -> SlotKind {
    match name {
        "in" => return SlotKind::Input(1),
        "ins" => return SlotKind::Inputs(1),
        "out" => return SlotKind::Output(None),
        _ if CONTEXT_SLOTS.contains(&name) => return SlotKind::Context,
        _ => {}
    }
    if let Some(n) = name.strip_prefix("in_").and_then(positive_index) {
        return SlotKind::Input(n);
    }
    if let Some(n) = name.strip_prefix("ins_").and_then(positive_index) {
        return SlotKind::Inputs(n);
    }
    if let Some(output) = name.strip_prefix("out_").filter(|s| !s.is_empty()) {
        return SlotKind::Output(Some(output.to_string()));
    }
    SlotKind::Param
}

fn positive_index(digits: &str) -> Option<usize> {
    digits.parse().ok().filter(|n| *n > 0)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Declaration of one external operator
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorSpec {
    name: String,
    template: Template,
    format: Format,
    arity: Arity,
    params: BTreeMap<String, Option<ParamValue>>,
    outputs: Vec<String>,
    selects: bool,
    timewise: bool,
    ensemble_aware: bool,
    output_var: Option<Template>,
}

impl OperatorSpec {
    /// Declare an operator from its command template.
    ///
    /// Arity, parameters and secondary outputs are read off the template's
    /// slots. The template must contain `${out}`.
    pub fn new(name: &str, command: &str) -> Result<Self, ExprError> {
        if !is_identifier(name) || RESERVED_NAMES.contains(&name) {
            return Err(ExprError::InvalidName {
                name: name.to_string(),
            });
        }
        let template = Template::parse(command)?;

        let mut positional = 0;
        let mut variadic_from: Option<usize> = None;
        let mut has_out = false;
        let mut outputs = Vec::new();
        let mut params = BTreeMap::new();
        let mut ensemble_aware = false;

        for slot in template.slots() {
            match classify_slot(slot) {
                SlotKind::Input(n) => positional = positional.max(n),
                SlotKind::Inputs(n) => {
                    variadic_from = Some(variadic_from.map_or(n, |from| from.min(n)))
                }
                SlotKind::Output(None) => has_out = true,
                SlotKind::Output(Some(output)) => {
                    if !outputs.contains(&output) {
                        outputs.push(output);
                    }
                }
                SlotKind::Context => ensemble_aware |= slot == "labels",
                SlotKind::Param => {
                    params.entry(slot.to_string()).or_insert(None);
                }
            }
        }

        if !has_out {
            return Err(ExprError::Template {
                template: command.to_string(),
                reason: "missing ${out}".to_string(),
            });
        }

        let arity = match variadic_from {
            None => Arity {
                min: positional,
                max: Some(positional),
            },
            Some(from) => Arity {
                min: positional.max(from),
                max: None,
            },
        };

        Ok(Self {
            name: name.to_string(),
            template,
            format: Format::NetCdf,
            arity,
            params,
            outputs,
            selects: false,
            timewise: false,
            ensemble_aware,
            output_var: None,
        })
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Declare (or give a default to) a parameter
    pub fn with_default(mut self, param: &str, value: ParamValue) -> Result<Self, ExprError> {
        if classify_slot(param) != SlotKind::Param || !is_identifier(param) {
            return Err(ExprError::UnknownParameter {
                operator: self.name.clone(),
                parameter: param.to_string(),
            });
        }
        self.params.insert(param.to_string(), Some(value));
        Ok(self)
    }

    pub fn with_selects(mut self, selects: bool) -> Self {
        self.selects = selects;
        self
    }

    pub fn with_timewise(mut self, timewise: bool) -> Self {
        self.timewise = timewise;
        self
    }

    /// `${labels}` in the template already implies ensemble awareness.
    pub fn with_ensemble_aware(mut self, aware: bool) -> Self {
        self.ensemble_aware |= aware;
        self
    }

    /// Output variable name template; only `${var}` may appear in it.
    pub fn with_output_var(mut self, template: &str) -> Result<Self, ExprError> {
        let parsed = Template::parse(template)?;
        if let Some(slot) = parsed.slots().find(|slot| *slot != "var") {
            return Err(ExprError::Template {
                template: template.to_string(),
                reason: format!("only ${{var}} is allowed, found ${{{}}}", slot),
            });
        }
        self.output_var = Some(parsed);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn arity(&self) -> Arity {
        self.arity
    }

    /// Secondary output names, in template order
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn selects(&self) -> bool {
        self.selects
    }

    pub fn is_timewise(&self) -> bool {
        self.timewise
    }

    pub fn is_ensemble_aware(&self) -> bool {
        self.ensemble_aware
    }

    pub fn declares(&self, param: &str) -> bool {
        self.params.contains_key(param)
    }

    pub fn param_default(&self, param: &str) -> Option<&ParamValue> {
        self.params.get(param).and_then(Option::as_ref)
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, Option<&ParamValue>)> {
        self.params
            .iter()
            .map(|(name, default)| (name.as_str(), default.as_ref()))
    }

    /// Variable name of a result computed from an input named `input_var`
    pub fn output_variable(&self, input_var: &str) -> String {
        match &self.output_var {
            Some(template) => template
                .render(|_| Some(input_var.to_string()))
                .unwrap_or_else(|_| input_var.to_string()),
            None => input_var.to_string(),
        }
    }
}

/// Operators and macros known to the parser
#[derive(Debug, Clone)]
pub struct Registry {
    operators: BTreeMap<String, Arc<OperatorSpec>>,
    macros: BTreeMap<String, Macro>,
}

impl Registry {
    /// Empty registry holding only the built-in `select`
    pub fn with_builtins() -> Result<Self, ExprError> {
        let select = OperatorSpec::new(SELECT, SELECT_COMMAND)?
            .with_selects(true)
            .with_timewise(true);

        let mut registry = Self {
            operators: BTreeMap::new(),
            macros: BTreeMap::new(),
        };
        registry.register(select)?;
        Ok(registry)
    }

    /// Add or replace an operator. Returns the replaced declaration.
    pub fn register(&mut self, spec: OperatorSpec) -> Result<Option<Arc<OperatorSpec>>, ExprError> {
        if self.macros.contains_key(spec.name()) {
            return Err(ExprError::Macro {
                name: spec.name().to_string(),
                reason: "name already used by a macro".to_string(),
            });
        }
        Ok(self
            .operators
            .insert(spec.name().to_string(), Arc::new(spec)))
    }

    pub fn operator(&self, name: &str) -> Result<Arc<OperatorSpec>, ExprError> {
        self.operators
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnknownOperator {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }

    pub fn select(&self) -> Result<Arc<OperatorSpec>, ExprError> {
        self.operator(SELECT)
    }

    pub fn operator_names(&self) -> impl Iterator<Item = &str> {
        self.operators.keys().map(String::as_str)
    }

    /// Define a macro whose body refers to its arguments as `ARG` / `ARG1..N`.
    pub fn define_macro(&mut self, name: &str, body: &str) -> Result<(), ExprError> {
        if !is_identifier(name) || RESERVED_NAMES.contains(&name) || self.contains(name) {
            return Err(ExprError::Macro {
                name: name.to_string(),
                reason: "name clashes with an operator or reserved word".to_string(),
            });
        }
        let definition = Macro::parse(name, body)?;
        self.macros.insert(name.to_string(), definition);
        Ok(())
    }

    pub(crate) fn macro_def(&self, name: &str) -> Option<&Macro> {
        self.macros.get(name)
    }

    /// Parse expression text (CRS syntax plus macro calls) into a node.
    pub fn parse(&self, text: &str) -> Result<Node, ExprError> {
        parser::parse(self, text)
    }
}
