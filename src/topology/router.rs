//! Content-addressed fan-out: does not use the graph edges for routing.
//! Downstream ports are registered by name (via [`Router::register_destination`])
//! before `run` starts; `route_fn` maps each element to the list of
//! destination names it should reach, and an empty list drops the element.
//! A rule list plus an optional default destination is the config-driven
//! shape every built-in router needs; `default_destination` is also what
//! makes error-forwarding through a router deterministic, since a control
//! element rarely matches a metadata-keyed rule.

use crate::config::{StageParams, StageSpec, extract_param};
use crate::core::context::RunContext;
use crate::element::Element;
use crate::stage::{Inbound, Outbound, Stage, StageKind};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Deserialize)]
pub struct RouteRule {
    pub metadata_key: String,
    pub metadata_equals: Value,
    pub destination: String,
}

#[derive(Debug, Clone, Default)]
pub struct RouterParams {
    pub rules: Vec<RouteRule>,
    pub default_destination: Option<String>,
}

impl StageParams for RouterParams {
    fn from_spec(spec: &StageSpec) -> anyhow::Result<Self> {
        Ok(Self {
            rules: extract_param(&spec.parameters, "rules", Vec::new()),
            default_destination: extract_param(&spec.parameters, "default_destination", None),
        })
    }
}

pub struct Router {
    name: String,
    params: RouterParams,
    destinations: Mutex<HashMap<String, Outbound>>,
}

impl Router {
    pub fn new(name: &str, spec: &StageSpec) -> anyhow::Result<Self> {
        Ok(Self {
            name: name.to_string(),
            params: RouterParams::from_spec(spec)?,
            destinations: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a downstream port under `name`. Must be called for every
    /// name `route_fn` can return before `run` is driven; the pipeline
    /// runtime does this once per router out-edge instead of folding them
    /// into a single broadcast port.
    pub fn register_destination(&self, name: impl Into<String>, outbound: Outbound) {
        self.destinations.lock().unwrap().insert(name.into(), outbound);
    }

    /// `route_fn`: the destinations this element should reach. Empty means
    /// drop.
    fn route(&self, element: &Element) -> Vec<String> {
        for rule in &self.params.rules {
            if element.get_metadata(&rule.metadata_key) == Some(&rule.metadata_equals) {
                return vec![rule.destination.clone()];
            }
        }
        match &self.params.default_destination {
            Some(d) => vec![d.clone()],
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl Stage for Router {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    fn named_destinations(&self) -> bool {
        true
    }

    fn register_destination(&self, name: &str, outbound: Outbound) {
        Router::register_destination(self, name, outbound);
    }

    async fn run(&self, ctx: RunContext, mut input: Inbound, output: Outbound) -> anyhow::Result<()> {
        while let Some(element) = input.recv(&ctx).await {
            let names = self.route(&element);
            if names.is_empty() {
                continue;
            }
            let destinations = self.destinations.lock().unwrap();
            for name in &names {
                match destinations.get(name) {
                    Some(port) => {
                        let _ = port.send(&ctx, element.clone()).await;
                    }
                    None => tracing::warn!(router = %self.name, destination = %name, "route named an unregistered destination"),
                }
            }
        }

        let destinations = self.destinations.lock().unwrap();
        for port in destinations.values() {
            port.close();
        }
        drop(destinations);
        output.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::{Channel, ChannelType, PubSubChannel};
    use crate::stage::{ChannelOutbound, SubscriberInbound};
    use std::sync::Arc;

    fn router(default_destination: Option<&str>) -> Router {
        Router {
            name: "r".to_string(),
            params: RouterParams {
                rules: vec![RouteRule {
                    metadata_key: "kind".to_string(),
                    metadata_equals: Value::String("audio".to_string()),
                    destination: "audio_branch".to_string(),
                }],
                default_destination: default_destination.map(str::to_string),
            },
            destinations: Mutex::new(HashMap::new()),
        }
    }

    #[test]
    fn route_fn_picks_matching_rule_or_falls_back_to_default() {
        let router = router(Some("text_branch"));

        let matching = Element::new_text("x").with_metadata("kind", "audio");
        assert_eq!(router.route(&matching), vec!["audio_branch".to_string()]);

        let fallback = Element::new_text("x");
        assert_eq!(router.route(&fallback), vec!["text_branch".to_string()]);
    }

    #[test]
    fn no_default_destination_means_no_match_drops() {
        let router = router(None);
        let unmatched = Element::new_text("x");
        assert!(router.route(&unmatched).is_empty());
    }

    #[tokio::test]
    async fn forwards_only_to_named_destination_not_every_sibling() {
        let router = router(Some("text_branch"));

        let audio_channel: Arc<dyn PubSubChannel<Element>> = Arc::new(Channel::new(ChannelType::Direct, 8));
        let text_channel: Arc<dyn PubSubChannel<Element>> = Arc::new(Channel::new(ChannelType::Direct, 8));
        router.register_destination("audio_branch", Arc::new(ChannelOutbound(audio_channel.clone())));
        router.register_destination("text_branch", Arc::new(ChannelOutbound(text_channel.clone())));

        let mut audio_in = SubscriberInbound(audio_channel.subscribe());
        let mut text_in = SubscriberInbound(text_channel.subscribe());

        let input_channel: Arc<dyn PubSubChannel<Element>> = Arc::new(Channel::new(ChannelType::Direct, 8));
        let input: Inbound = Box::new(SubscriberInbound(input_channel.subscribe()));
        let sink_channel: Arc<dyn PubSubChannel<Element>> = Arc::new(Channel::new(ChannelType::Direct, 8));
        let output: Outbound = Arc::new(ChannelOutbound(sink_channel));

        input_channel.publish(Element::new_text("a").with_metadata("kind", "audio")).await.unwrap();
        input_channel.publish(Element::new_text("b")).await.unwrap();
        input_channel.close();

        let ctx = RunContext::new();
        router.run(ctx.clone(), input, output).await.unwrap();

        let from_audio = audio_in.recv(&ctx).await.unwrap();
        assert_eq!(from_audio.extract_text().as_deref(), Some("a"));
        assert!(audio_in.recv(&ctx).await.is_none());

        let from_text = text_in.recv(&ctx).await.unwrap();
        assert_eq!(from_text.extract_text().as_deref(), Some("b"));
        assert!(text_in.recv(&ctx).await.is_none());
    }
}
