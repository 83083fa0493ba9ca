//! Stateless text transform keyed by a configured operation. Grounded on the
//! teacher's `ScaleProcessor`: a `*Params` struct built via `StageParams`,
//! applied per element inside a plain recv/send loop.

use crate::config::{StageParams, StageSpec, extract_param};
use crate::core::context::RunContext;
use crate::element::Element;
use crate::stage::{Inbound, Outbound, Stage, StageKind};

use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MapOperation {
    #[default]
    Uppercase,
    Lowercase,
    Trim,
}

#[derive(Debug, Clone, Default)]
pub struct MapParams {
    pub operation: MapOperation,
}

impl StageParams for MapParams {
    fn from_spec(spec: &StageSpec) -> anyhow::Result<Self> {
        Ok(Self {
            operation: extract_param(&spec.parameters, "operation", MapOperation::default()),
        })
    }
}

pub struct Map {
    name: String,
    params: MapParams,
}

impl Map {
    pub fn new(name: &str, spec: &StageSpec) -> anyhow::Result<Self> {
        Ok(Self {
            name: name.to_string(),
            params: MapParams::from_spec(spec)?,
        })
    }

    fn apply(&self, text: &str) -> String {
        match self.params.operation {
            MapOperation::Uppercase => text.to_uppercase(),
            MapOperation::Lowercase => text.to_lowercase(),
            MapOperation::Trim => text.trim().to_string(),
        }
    }
}

#[async_trait]
impl Stage for Map {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    async fn run(&self, ctx: RunContext, mut input: Inbound, output: Outbound) -> anyhow::Result<()> {
        while let Some(element) = input.recv(&ctx).await {
            if element.is_control() {
                if output.send(&ctx, element).await.is_err() {
                    break;
                }
                continue;
            }
            let Some(text) = element.extract_text() else {
                if output.send(&ctx, element).await.is_err() {
                    break;
                }
                continue;
            };
            let mapped = Element::new_text(self.apply(&text))
                .with_metadata("mapped_by", self.name.clone());
            if output.send(&ctx, mapped).await.is_err() {
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

    #[tokio::test]
    async fn uppercases_text_content() {
        let mut parameters = HashMap::new();
        parameters.insert("operation".to_string(), serde_json::json!("uppercase"));
        let spec = StageSpec {
            kind: "map".to_string(),
            parameters: Some(parameters),
        };
        let stage = Map::new("upper", &spec).unwrap();

        let pipeline = crate::builder::Builder::new()
            .add_stage(std::sync::Arc::new(stage))
            .build()
            .unwrap();

        let out = pipeline
            .execute_sync(vec![Element::new_text("shout")])
            .await
            .unwrap();

        assert_eq!(out[0].extract_text().as_deref(), Some("SHOUT"));
    }

    #[tokio::test]
    async fn control_elements_pass_through_unmapped() {
        let spec = StageSpec { kind: "map".to_string(), parameters: None };
        let stage = Map::new("upper", &spec).unwrap();
        let pipeline = crate::builder::Builder::new()
            .add_stage(std::sync::Arc::new(stage))
            .build()
            .unwrap();

        let out = pipeline
            .execute_sync(vec![Element::new_end_of_stream()])
            .await
            .unwrap();
        assert!(out[0].is_end_of_stream());
    }
}
