//! Forwards every element unchanged. Used as the entry/exit stage in the
//! default config ([`crate::config::loader::default_config`]) and as a
//! building block for tests.

use crate::core::context::RunContext;
use crate::element::Element;
use crate::stage::{Inbound, Outbound, Stage, StageKind};

use async_trait::async_trait;

pub struct Passthrough {
    name: String,
}

impl Passthrough {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Stage for Passthrough {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    async fn run(&self, ctx: RunContext, mut input: Inbound, output: Outbound) -> anyhow::Result<()> {
        while let Some(element) = input.recv(&ctx).await {
            if output.send(&ctx, element).await.is_err() {
                break;
            }
        }
        output.close();
        Ok(())
    }
}
