//! Field Configuration Module
//!
//! Some topology stages (map, legacy adapter's metadata lifting) need to
//! describe a field-rename style transformation declaratively rather than
//! via a closure. `FieldConfig` is the small sum type for that.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldConfig {
    Single { input: String, output: String },
    Multiple { inputs: Vec<String>, outputs: Vec<String> },
    Mapping(HashMap<String, String>),
    OutputOnly(String),
    None,
}

impl FieldConfig {
    pub fn single(input: impl Into<String>, output: impl Into<String>) -> anyhow::Result<Self> {
        let config = Self::Single {
            input: input.into(),
            output: output.into(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            FieldConfig::Single { input, output } => {
                if input.is_empty() || output.is_empty() {
                    return Err(anyhow::anyhow!("field names cannot be empty"));
                }
            }
            FieldConfig::Multiple { inputs, outputs } => {
                if inputs.is_empty() {
                    return Err(anyhow::anyhow!("multiple field config cannot have empty inputs"));
                }
                if inputs.len() != outputs.len() {
                    return Err(anyhow::anyhow!(
                        "input fields ({}) and output fields ({}) count mismatch",
                        inputs.len(),
                        outputs.len()
                    ));
                }
            }
            FieldConfig::Mapping(map) => {
                if map.is_empty() {
                    return Err(anyhow::anyhow!("field mapping cannot be empty"));
                }
            }
            FieldConfig::OutputOnly(field) => {
                if field.is_empty() {
                    return Err(anyhow::anyhow!("output field name cannot be empty"));
                }
            }
            FieldConfig::None => {}
        }
        Ok(())
    }

    pub fn get_output_for_input(&self, input: &str) -> Option<String> {
        match self {
            FieldConfig::Single { input: i, output } if i == input => Some(output.clone()),
            FieldConfig::Multiple { inputs, outputs } => inputs
                .iter()
                .position(|i| i == input)
                .and_then(|index| outputs.get(index).cloned()),
            FieldConfig::Mapping(map) => map.get(input).cloned(),
            _ => None,
        }
    }
}

impl fmt::Display for FieldConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldConfig::Single { input, output } => write!(f, "{} → {}", input, output),
            FieldConfig::Multiple { inputs, outputs } => {
                let mappings: Vec<String> = inputs
                    .iter()
                    .zip(outputs.iter())
                    .map(|(i, o)| format!("{} → {}", i, o))
                    .collect();
                write!(f, "[{}]", mappings.join(", "))
            }
            FieldConfig::Mapping(map) => {
                let mappings: Vec<String> =
                    map.iter().map(|(i, o)| format!("{} → {}", i, o)).collect();
                write!(f, "{{{}}}", mappings.join(", "))
            }
            FieldConfig::OutputOnly(field) => write!(f, "→ {}", field),
            FieldConfig::None => write!(f, "no fields"),
        }
    }
}
