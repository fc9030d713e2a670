//! Filling operator templates
//!
//! | Slot                | Value                                         |
//! |---------------------|-----------------------------------------------|
//! | `in`, `in_N`        | files of the N-th operand                     |
//! | `ins`, `ins_N`      | files of all operands from the N-th on        |
//! | `out`, `out_NAME`   | temporary path of the main / named output     |
//! | `var`               | variable name of the result                   |
//! | `period`            | canonical period text                         |
//! | `period_iso`        | `start,last` ISO range                        |
//! | `domain`            | spatial domain                                |
//! | `labels`            | ensemble labels in order                      |
//! | `crs`               | CRS of the node being computed                |
//! | anything else       | operator parameter (empty when unset)         |
//!
//! Every substituted value is shell-quoted.
use std::path::PathBuf;

use super::Evaluated;
use crate::expr::{classify_slot, shell_quote, Apply, SlotKind, Template};
use crate::period::Period;

pub(crate) struct RenderContext<'a> {
    pub inputs: &'a [Evaluated],
    pub outputs: &'a [(Option<String>, PathBuf)],
    pub variable: &'a str,
    pub period: Option<&'a Period>,
    pub domain: &'a str,
    pub labels: &'a [String],
    pub crs: &'a str,
    pub apply: Option<&'a Apply>,
}

impl RenderContext<'_> {
    fn resolve(&self, slot: &str) -> Option<String> {
        match classify_slot(slot) {
            SlotKind::Input(n) => self.inputs.get(n - 1).map(|input| quote_paths(input.paths())),
            SlotKind::Inputs(n) => Some(quote_paths(
                self.inputs
                    .iter()
                    .skip(n - 1)
                    .flat_map(Evaluated::paths)
                    .collect(),
            )),
            SlotKind::Output(name) => self
                .outputs
                .iter()
                .find(|(output, _)| *output == name)
                .map(|(_, path)| shell_quote(&path.display().to_string())),
            SlotKind::Context => match slot {
                "var" => Some(shell_quote(self.variable)),
                "period" => Some(shell_quote(self.period.map_or("", Period::label))),
                "period_iso" => Some(shell_quote(
                    &self
                        .period
                        .and_then(Period::to_iso_range)
                        .unwrap_or_default(),
                )),
                "domain" => Some(shell_quote(self.domain)),
                "labels" => Some(
                    self.labels
                        .iter()
                        .map(|label| shell_quote(label))
                        .collect::<Vec<_>>()
                        .join(" "),
                ),
                "crs" => Some(shell_quote(self.crs)),
                _ => None,
            },
            SlotKind::Param => {
                let apply = self.apply?;
                match apply.param(slot) {
                    Some(value) => Some(shell_quote(&value.to_raw())),
                    None if apply.operator().declares(slot) => Some(String::new()),
                    None => None,
                }
            }
        }
    }
}

fn quote_paths(paths: Vec<PathBuf>) -> String {
    paths
        .iter()
        .map(|path| shell_quote(&path.display().to_string()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render `template`; fails with the first slot that has no value.
pub(crate) fn render(template: &Template, context: &RenderContext<'_>) -> Result<String, String> {
    template.render(|slot| context.resolve(slot))
}
