//! Explicit N→1 fan-in: drains several inbound ports concurrently into one,
//! tagging each forwarded element with which upstream it came from via
//! `merge_input_index`.
//!
//! This is the single implementation behind two call sites: the pipeline
//! runtime uses it whenever a stage in the built graph has more than one
//! incoming edge (§4.4), and a stage can call it directly when it manages
//! its own sub-streams internally (e.g. a duplex stage merging the
//! microphone and provider-response streams before a single read loop).

use crate::core::context::RunContext;
use crate::element::Element;
use crate::stage::{Inbound, InboundPort};

struct MergeInbound(tokio::sync::mpsc::Receiver<Element>);

#[async_trait::async_trait]
impl InboundPort for MergeInbound {
    async fn recv(&mut self, ctx: &RunContext) -> Option<Element> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => None,
            element = self.0.recv() => element,
        }
    }
}

/// Spawns one forwarding task per input. The merged channel closes once
/// every task has observed its upstream close, since each task drops its
/// sender clone on exit and the last drop ends the receiver's stream.
pub fn merge_inbound(capacity: usize, ctx: RunContext, inputs: Vec<Inbound>) -> Inbound {
    let (tx, rx) = tokio::sync::mpsc::channel::<Element>(capacity.max(1));
    for (idx, mut input) in inputs.into_iter().enumerate() {
        let tx = tx.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            while let Some(element) = input.recv(&ctx).await {
                let tagged = element.with_metadata("merge_input_index", idx as u64);
                if tx.send(tagged).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);
    Box::new(MergeInbound(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::{Channel, PubSubChannel};
    use crate::config::types::ChannelType;
    use std::sync::Arc;

    #[tokio::test]
    async fn tags_each_source_and_closes_when_all_drain() {
        let ctx = RunContext::new();

        let a: Arc<dyn PubSubChannel<Element>> = Arc::new(Channel::new(ChannelType::Direct, 4));
        let b: Arc<dyn PubSubChannel<Element>> = Arc::new(Channel::new(ChannelType::Direct, 4));

        let inputs: Vec<Inbound> = vec![
            Box::new(crate::stage::SubscriberInbound(a.subscribe())),
            Box::new(crate::stage::SubscriberInbound(b.subscribe())),
        ];
        let mut merged = merge_inbound(4, ctx.clone(), inputs);

        a.publish(Element::new_text("from-a")).await.unwrap();
        a.close();
        b.publish(Element::new_text("from-b")).await.unwrap();
        b.close();

        let mut seen = Vec::new();
        while let Some(element) = merged.recv(&ctx).await {
            seen.push(element.get_metadata("merge_input_index").and_then(|v| v.as_u64()));
        }
        seen.sort();
        assert_eq!(seen, vec![Some(0), Some(1)]);
    }
}
