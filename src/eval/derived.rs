//! Variables computed from other variables
//!
//! ```toml
//! [[derived]]
//! variable = "tas_degc"
//! operator = "to_celsius"
//! inputs = ["tas"]
//! ```
//!
//! A dataset asking for `tas_degc` becomes `to_celsius(ds(...variable='tas'...))`.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::expr::{Apply, Dataset, ExprError, Node, ParamValue, Registry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedDefinition {
    pub variable: String,
    pub operator: String,
    pub inputs: Vec<String>,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
}

#[derive(Debug, Clone, Default)]
pub struct DerivedVariables {
    definitions: BTreeMap<String, DerivedDefinition>,
}

impl DerivedVariables {
    pub fn new(definitions: impl IntoIterator<Item = DerivedDefinition>) -> Self {
        Self {
            definitions: definitions
                .into_iter()
                .map(|definition| (definition.variable.clone(), definition))
                .collect(),
        }
    }

    pub fn get(&self, variable: &str) -> Option<&DerivedDefinition> {
        self.definitions.get(variable)
    }

    pub fn contains(&self, variable: &str) -> bool {
        self.definitions.contains_key(variable)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// The application computing `dataset`, or `None` if its variable is
    /// not derived
    pub fn expand(&self, dataset: &Dataset, registry: &Registry) -> Result<Option<Node>, ExprError> {
        let Some(definition) = self.get(dataset.variable()) else {
            return Ok(None);
        };
        let operator = registry.operator(&definition.operator)?;
        let operands = definition
            .inputs
            .iter()
            .map(|input| Node::Dataset(dataset.with_variable(input)))
            .collect();
        let apply = Apply::new(operator, operands, definition.params.clone(), None)?;
        Ok(Some(Node::Apply(apply)))
    }
}
