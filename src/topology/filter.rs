//! Drops elements that fail a configured predicate. Grounded on the
//! teacher's `RuleConfig`/condition pattern, simplified to the one
//! comparison this runtime's metadata map needs: does `metadata[key]`
//! equal a configured value.

use crate::config::{StageParams, StageSpec, extract_param};
use crate::core::context::RunContext;
use crate::element::Element;
use crate::stage::{Inbound, Outbound, Stage, StageKind};

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct FilterParams {
    /// Control elements (`Error`/`EndOfStream`) always pass through
    /// regardless of this predicate; only content elements are filtered.
    pub metadata_key: Option<String>,
    pub metadata_equals: Option<Value>,
}

impl StageParams for FilterParams {
    fn from_spec(spec: &StageSpec) -> anyhow::Result<Self> {
        Ok(Self {
            metadata_key: extract_param(&spec.parameters, "metadata_key", None),
            metadata_equals: extract_param(&spec.parameters, "metadata_equals", None),
        })
    }
}

pub struct Filter {
    name: String,
    params: FilterParams,
}

impl Filter {
    pub fn new(name: &str, spec: &StageSpec) -> anyhow::Result<Self> {
        Ok(Self {
            name: name.to_string(),
            params: FilterParams::from_spec(spec)?,
        })
    }

    fn accepts(&self, element: &Element) -> bool {
        if element.is_control() {
            return true;
        }
        match (&self.params.metadata_key, &self.params.metadata_equals) {
            (Some(key), Some(expected)) => element.get_metadata(key) == Some(expected),
            _ => true,
        }
    }
}

#[async_trait]
impl Stage for Filter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    async fn run(&self, ctx: RunContext, mut input: Inbound, output: Outbound) -> anyhow::Result<()> {
        while let Some(element) = input.recv(&ctx).await {
            if !self.accepts(&element) {
                tracing::debug!(stage = %self.name, sequence = element.sequence, "filter dropped element");
                continue;
            }
            if output.send(&ctx, element).await.is_err() {
                break;
            }
        }
        output.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn spec_with(key: &str, value: Value) -> StageSpec {
        let mut parameters = HashMap::new();
        parameters.insert("metadata_key".to_string(), Value::String(key.to_string()));
        parameters.insert("metadata_equals".to_string(), value);
        StageSpec {
            kind: "filter".to_string(),
            parameters: Some(parameters),
        }
    }

    #[tokio::test]
    async fn drops_elements_not_matching_tag() {
        let spec = spec_with("keep", Value::Bool(true));
        let filter = Filter::new("f", &spec).unwrap();

        let kept = Element::new_text("a").with_metadata("keep", true);
        let dropped = Element::new_text("b").with_metadata("keep", false);

        assert!(filter.accepts(&kept));
        assert!(!filter.accepts(&dropped));
    }

    #[tokio::test]
    async fn control_elements_always_pass() {
        let spec = spec_with("keep", Value::Bool(true));
        let filter = Filter::new("f", &spec).unwrap();
        assert!(filter.accepts(&Element::new_end_of_stream()));
    }
}
