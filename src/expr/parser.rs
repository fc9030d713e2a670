//! Expression text parser
//!
//! The accepted language is the CRS grammar plus macro calls:
//!
//! ```text
//! expr     := ensemble | call | ARG | ARGn
//! call     := name ['.' output] '(' [arg (',' arg)*] ')'
//! arg      := name '=' literal | expr
//! ensemble := 'ens' '(' label ':' expr (',' label ':' expr)* ')'
//! literal  := 'quoted' | true | false | number
//! ```
//!
//! `ds(...)` is a call whose arguments are all quoted facets plus `period`.
//! Text is first parsed into [`Syntax`] and then lowered against a
//! [`Registry`], which resolves operators and expands macros.

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric1, char, digit0, digit1, multispace0, one_of},
    combinator::{map, map_res, opt, recognize, value},
    multi::{many0, separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, separated_pair, terminated, tuple},
    IResult,
};
use std::collections::BTreeMap;

use super::{Apply, Dataset, Ensemble, ExprError, Node, ParamValue, Registry};
use crate::period::Period;

/// Nesting limit for macro expansion
const MAX_MACRO_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Syntax {
    Call {
        name: String,
        output: Option<String>,
        args: Vec<Arg>,
    },
    Ensemble(Vec<(String, Syntax)>),
    /// Bare name; only `ARG`/`ARGn` inside macro bodies resolve
    Reference(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Arg {
    Positional(Syntax),
    Named(String, ParamValue),
}

/// Restricted macro: an expression with `ARG`/`ARG1..N` holes
#[derive(Debug, Clone)]
pub struct Macro {
    body: Syntax,
    arity: usize,
}

impl Macro {
    pub(crate) fn parse(name: &str, body: &str) -> Result<Self, ExprError> {
        let body = parse_syntax(body)?;
        let arity = max_argument(&body).map_err(|reason| ExprError::Macro {
            name: name.to_string(),
            reason,
        })?;
        Ok(Self { body, arity })
    }
}

/// `ARG` is the first argument, `ARGn` the n-th
fn argument_index(name: &str) -> Option<usize> {
    let rest = name.strip_prefix("ARG")?;
    if rest.is_empty() {
        return Some(0);
    }
    rest.parse::<usize>().ok().filter(|n| *n > 0).map(|n| n - 1)
}

fn max_argument(syntax: &Syntax) -> Result<usize, String> {
    match syntax {
        Syntax::Reference(name) => argument_index(name)
            .map(|index| index + 1)
            .ok_or_else(|| format!("unknown name '{}'", name)),
        Syntax::Ensemble(members) => members.iter().try_fold(0, |max, (_, member)| {
            Ok(max.max(max_argument(member)?))
        }),
        Syntax::Call { args, .. } => args.iter().try_fold(0, |max, arg| match arg {
            Arg::Positional(inner) => Ok(max.max(max_argument(inner)?)),
            Arg::Named(..) => Ok(max),
        }),
    }
}

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

/// Single-quoted string with `\'` and `\\` escapes
fn quoted(input: &str) -> IResult<&str, String> {
    let (mut rest, _) = char('\'')(input)?;
    let mut out = String::new();
    loop {
        let mut chars = rest.chars();
        match chars.next() {
            Some('\'') => return Ok((chars.as_str(), out)),
            Some('\\') => match chars.next() {
                Some(c @ ('\'' | '\\')) => out.push(c),
                _ => {
                    return Err(nom::Err::Error(nom::error::Error::new(
                        rest,
                        nom::error::ErrorKind::Escaped,
                    )))
                }
            },
            Some(c) => out.push(c),
            None => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    rest,
                    nom::error::ErrorKind::Char,
                )))
            }
        }
        rest = chars.as_str();
    }
}

fn number(input: &str) -> IResult<&str, ParamValue> {
    map_res(
        recognize(tuple((
            opt(char('-')),
            digit1,
            opt(pair(char('.'), digit0)),
            opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
        ))),
        |text: &str| {
            if text.contains(|c: char| matches!(c, '.' | 'e' | 'E')) {
                text.parse::<f64>()
                    .map(ParamValue::Float)
                    .map_err(|e| e.to_string())
            } else {
                text.parse::<i64>()
                    .map(ParamValue::Int)
                    .map_err(|e| e.to_string())
            }
        },
    )(input)
}

fn literal(input: &str) -> IResult<&str, ParamValue> {
    alt((
        map(quoted, ParamValue::Str),
        value(ParamValue::Bool(true), tag("true")),
        value(ParamValue::Bool(false), tag("false")),
        number,
    ))(input)
}

fn argument(input: &str) -> IResult<&str, Arg> {
    alt((
        map(
            separated_pair(ws(identifier), char('='), ws(literal)),
            |(name, value)| Arg::Named(name.to_string(), value),
        ),
        map(expression, Arg::Positional),
    ))(input)
}

fn call(input: &str) -> IResult<&str, Syntax> {
    let (input, name) = identifier(input)?;
    let (input, output) = opt(preceded(char('.'), identifier))(input)?;
    let (input, args) = delimited(
        ws(char('(')),
        separated_list0(char(','), argument),
        ws(char(')')),
    )(input)?;
    Ok((
        input,
        Syntax::Call {
            name: name.to_string(),
            output: output.map(str::to_string),
            args,
        },
    ))
}

fn ensemble(input: &str) -> IResult<&str, Syntax> {
    map(
        preceded(
            pair(tag("ens"), ws(char('('))),
            terminated(
                separated_list1(
                    char(','),
                    separated_pair(ws(quoted), char(':'), expression),
                ),
                ws(char(')')),
            ),
        ),
        Syntax::Ensemble,
    )(input)
}

fn reference(input: &str) -> IResult<&str, Syntax> {
    map(identifier, |name| Syntax::Reference(name.to_string()))(input)
}

fn expression(input: &str) -> IResult<&str, Syntax> {
    ws(alt((ensemble, call, reference)))(input)
}

pub(crate) fn parse_syntax(text: &str) -> Result<Syntax, ExprError> {
    let (remaining, syntax) = expression(text).map_err(|e| ExprError::Parse {
        input: text.to_string(),
        reason: e.to_string(),
    })?;
    let remaining = remaining.trim();
    if !remaining.is_empty() {
        return Err(ExprError::Parse {
            input: text.to_string(),
            reason: format!("unexpected trailing input '{}'", remaining),
        });
    }
    Ok(syntax)
}

pub(crate) fn parse(registry: &Registry, text: &str) -> Result<Node, ExprError> {
    let syntax = parse_syntax(text)?;
    Lowering { registry, text }.lower(&syntax, &[], 0)
}

struct Lowering<'a> {
    registry: &'a Registry,
    text: &'a str,
}

impl Lowering<'_> {
    fn error(&self, reason: impl Into<String>) -> ExprError {
        ExprError::Parse {
            input: self.text.to_string(),
            reason: reason.into(),
        }
    }

    fn lower(&self, syntax: &Syntax, bindings: &[Node], depth: usize) -> Result<Node, ExprError> {
        match syntax {
            Syntax::Reference(name) => argument_index(name)
                .and_then(|index| bindings.get(index))
                .cloned()
                .ok_or_else(|| self.error(format!("unbound name '{}'", name))),

            Syntax::Ensemble(members) => {
                let members = members
                    .iter()
                    .map(|(label, member)| Ok((label.clone(), self.lower(member, bindings, depth)?)))
                    .collect::<Result<Vec<_>, ExprError>>()?;
                Ok(Node::Ensemble(Ensemble::new(members)?))
            }

            Syntax::Call { name, output, args } if name == "ds" => {
                if output.is_some() {
                    return Err(self.error("datasets have no secondary outputs"));
                }
                self.dataset(args).map(Node::Dataset)
            }

            Syntax::Call { name, output, args } if self.registry.contains(name) => {
                let operator = self.registry.operator(name)?;
                let mut operands = Vec::new();
                let mut params = BTreeMap::new();
                for arg in args {
                    match arg {
                        Arg::Positional(inner) => operands.push(self.lower(inner, bindings, depth)?),
                        Arg::Named(key, value) => {
                            if params.insert(key.clone(), value.clone()).is_some() {
                                return Err(self.error(format!("parameter '{}' given twice", key)));
                            }
                        }
                    }
                }
                Ok(Node::Apply(Apply::new(operator, operands, params, output.clone())?))
            }

            Syntax::Call { name, output, args } => {
                let Some(definition) = self.registry.macro_def(name) else {
                    return Err(ExprError::UnknownOperator { name: name.clone() });
                };
                let macro_error = |reason: String| ExprError::Macro {
                    name: name.clone(),
                    reason,
                };
                if depth >= MAX_MACRO_DEPTH {
                    return Err(macro_error("expansion too deep".to_string()));
                }
                if output.is_some() {
                    return Err(macro_error("macros have no secondary outputs".to_string()));
                }
                let mut arguments = Vec::with_capacity(args.len());
                for arg in args {
                    match arg {
                        Arg::Positional(inner) => arguments.push(self.lower(inner, bindings, depth)?),
                        Arg::Named(key, _) => {
                            return Err(macro_error(format!("unexpected parameter '{}'", key)))
                        }
                    }
                }
                if arguments.len() != definition.arity {
                    return Err(macro_error(format!(
                        "expects {} argument(s), got {}",
                        definition.arity,
                        arguments.len()
                    )));
                }
                self.lower(&definition.body, &arguments, depth + 1)
            }
        }
    }

    fn dataset(&self, args: &[Arg]) -> Result<Dataset, ExprError> {
        let mut facets = BTreeMap::new();
        let mut period = None;
        for arg in args {
            let Arg::Named(key, ParamValue::Str(value)) = arg else {
                return Err(self.error("dataset arguments are quoted facets"));
            };
            if key == "period" {
                period = Some(Period::parse(value)?);
            } else if facets.insert(key.clone(), value.clone()).is_some() {
                return Err(self.error(format!("facet '{}' given twice", key)));
            }
        }
        let period = period.ok_or_else(|| self.error("dataset has no period"))?;
        Dataset::new(facets, period)
    }
}
