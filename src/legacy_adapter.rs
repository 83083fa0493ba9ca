//! Wraps a request/response middleware as a transform stage (§4.7).
//!
//! The full `process(execCtx, next)` middleware-chain shape is out of
//! scope here (the chaining/dispatch logic belongs to whatever hosts the
//! middleware, not to this stage); `LegacyAdapter` calls a single
//! [`Middleware`] once per batch, which is the shape every call site in
//! this crate actually needs.

use crate::core::context::RunContext;
use crate::element::{Content, Element, Message, Priority};
use crate::stage::{Inbound, Outbound, Stage, StageKind};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Synthetic request state a legacy middleware operates on, assembled from
/// the inbound elements' content and known metadata keys.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub messages: Vec<Message>,
    pub metadata: HashMap<String, Value>,
    pub trace: Vec<String>,
    pub system_prompt: Option<String>,
    pub variables: Option<Value>,
    pub allowed_tools: Option<Value>,
    pub response: Option<Message>,
    pub cost: f64,
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn process(&self, ctx: &mut ExecutionContext) -> anyhow::Result<()>;
}

pub struct LegacyAdapter {
    name: String,
    middleware: Arc<dyn Middleware>,
}

impl LegacyAdapter {
    pub fn new(name: impl Into<String>, middleware: Arc<dyn Middleware>) -> Self {
        Self {
            name: name.into(),
            middleware,
        }
    }
}

const LIFTED_METADATA_KEYS: [&str; 3] = ["system_prompt", "variables", "allowed_tools"];

#[async_trait]
impl Stage for LegacyAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    async fn run(&self, ctx: RunContext, mut input: Inbound, output: Outbound) -> anyhow::Result<()> {
        let mut exec_ctx = ExecutionContext::default();
        exec_ctx.trace.push(format!("{}:accumulate", self.name));

        while let Some(element) = input.recv(&ctx).await {
            if let Some(Content::Message(message)) = element.content() {
                exec_ctx.messages.push(message.clone());
            }
            for key in LIFTED_METADATA_KEYS {
                if let Some(value) = element.get_metadata(key) {
                    match key {
                        "system_prompt" => exec_ctx.system_prompt = value.as_str().map(str::to_string),
                        "variables" => exec_ctx.variables = Some(value.clone()),
                        "allowed_tools" => exec_ctx.allowed_tools = Some(value.clone()),
                        _ => unreachable!(),
                    }
                } else if let Some(existing) = exec_ctx.metadata.get(key) {
                    let _ = existing;
                }
            }
            exec_ctx.metadata.extend(element.metadata.clone());
        }

        exec_ctx.trace.push(format!("{}:process", self.name));
        if let Err(err) = self.middleware.process(&mut exec_ctx).await {
            tracing::error!(stage = %self.name, error = %err, "legacy middleware failed");
            let _ = output.send(&ctx, Element::new_error(err.to_string())).await;
            output.close();
            return Err(err);
        }

        let last_message = exec_ctx.messages.last().cloned();

        for message in &exec_ctx.messages {
            if output.send(&ctx, Element::new_message(message.clone())).await.is_err() {
                output.close();
                return Ok(());
            }
        }

        if let Some(response) = &exec_ctx.response {
            let distinct = last_message.as_ref().map(|m| m.content != response.content).unwrap_or(true);
            if distinct && output.send(&ctx, Element::new_message(response.clone())).await.is_err() {
                output.close();
                return Ok(());
            }
        }

        let trailer = Element::new_empty()
            .with_metadata("trace", serde_json::to_value(&exec_ctx.trace).unwrap_or(Value::Null))
            .with_metadata("cost", exec_ctx.cost)
            .with_priority(Priority::Low);
        let _ = output.send(&ctx, trailer).await;

        output.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoMiddleware;

    #[async_trait]
    impl Middleware for EchoMiddleware {
        async fn process(&self, ctx: &mut ExecutionContext) -> anyhow::Result<()> {
            ctx.cost = 0.01;
            ctx.response = ctx.messages.last().cloned();
            Ok(())
        }
    }

    #[tokio::test]
    async fn emits_messages_then_a_low_priority_trailer() {
        let stage = LegacyAdapter::new("legacy", Arc::new(EchoMiddleware));
        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(stage))
            .build()
            .unwrap();

        let message = Message {
            role: "user".to_string(),
            content: "hello".to_string(),
            parts: Vec::new(),
            tool_calls: Vec::new(),
            timestamp: 0,
        };

        let out = pipeline.execute_sync(vec![Element::new_message(message)]).await.unwrap();

        assert_eq!(out.len(), 2);
        assert!(matches!(out[0].content(), Some(Content::Message(_))));
        assert_eq!(out[1].priority, Priority::Low);
        assert!(out[1].get_metadata("trace").is_some());
    }
}
