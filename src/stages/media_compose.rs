//! N→1 fan-in half of the media extract/compose pair. Correlates processed
//! media elements by `message_id`, using a [`dashmap::DashMap`] for the
//! pending-message table the way the wider grounding family uses it for
//! per-correlation accumulator state touched from both the main recv loop
//! and a periodic timeout sweep.

use crate::core::context::RunContext;
use crate::element::{Content, Element, Message, MessagePart};
use crate::stage::{Inbound, Outbound, Stage, StageKind};

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

struct Pending {
    original_message: Message,
    total_parts: usize,
    received: std::collections::HashMap<usize, MessagePart>,
    last_update: Instant,
}

impl Pending {
    fn is_complete(&self) -> bool {
        self.received.len() >= self.total_parts
    }

    fn rebuild(self) -> Message {
        let mut message = self.original_message;
        for (index, part) in self.received {
            if let Some(slot) = message.parts.get_mut(index) {
                *slot = part;
            }
        }
        message
    }
}

pub struct MediaCompose {
    name: String,
    completion_timeout: Duration,
    sweep_interval: Duration,
}

impl MediaCompose {
    pub fn new(name: impl Into<String>, completion_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            completion_timeout,
            sweep_interval: Duration::from_millis(500).min(completion_timeout.max(Duration::from_millis(1))),
        }
    }
}

fn part_from_content(content: &Content) -> Option<MessagePart> {
    match content {
        Content::Image(image) => Some(MessagePart::Image(image.clone())),
        Content::Video(video) => Some(MessagePart::Video(video.clone())),
        _ => None,
    }
}

#[async_trait]
impl Stage for MediaCompose {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Accumulate
    }

    async fn run(&self, ctx: RunContext, mut input: Inbound, output: Outbound) -> anyhow::Result<()> {
        let pending: DashMap<String, Pending> = DashMap::new();
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                element = input.recv(&ctx) => {
                    let Some(element) = element else { break };

                    if element.is_control() {
                        if output.send(&ctx, element).await.is_err() {
                            return Ok(());
                        }
                        continue;
                    }

                    let Some(message_id) = element.get_metadata_str("message_id").map(str::to_string) else {
                        if output.send(&ctx, element).await.is_err() {
                            return Ok(());
                        }
                        continue;
                    };
                    let Some(part_index) = element.get_metadata("part_index").and_then(|v| v.as_u64()) else {
                        continue;
                    };
                    let Some(part) = element.content().and_then(part_from_content) else {
                        continue;
                    };

                    let total_parts = element.get_metadata("total_parts").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                    let original_message: Option<Message> = element
                        .get_metadata("original_message")
                        .and_then(|v| serde_json::from_value(v.clone()).ok());

                    let complete = {
                        let mut entry = pending.entry(message_id.clone()).or_insert_with(|| Pending {
                            original_message: original_message.clone().unwrap_or_default(),
                            total_parts,
                            received: std::collections::HashMap::new(),
                            last_update: Instant::now(),
                        });
                        entry.received.insert(part_index as usize, part);
                        entry.last_update = Instant::now();
                        entry.is_complete()
                    };

                    if complete {
                        if let Some((_, pending_entry)) = pending.remove(&message_id) {
                            let message = pending_entry.rebuild();
                            if output.send(&ctx, Element::new_message(message)).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
                _ = sweep.tick() => {
                    let stale: Vec<String> = pending
                        .iter()
                        .filter(|entry| entry.value().last_update.elapsed() >= self.completion_timeout)
                        .map(|entry| entry.key().clone())
                        .collect();
                    for key in stale {
                        if let Some((_, pending_entry)) = pending.remove(&key) {
                            tracing::warn!(stage = %self.name, message_id = %key, "composing message after completion timeout");
                            let message = pending_entry.rebuild();
                            if output.send(&ctx, Element::new_message(message)).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }

        for (_, pending_entry) in pending.into_iter() {
            let message = pending_entry.rebuild();
            let _ = output.send(&ctx, Element::new_message(message)).await;
        }
        output.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ImageData;
    use std::sync::Arc;

    #[tokio::test]
    async fn composes_message_once_all_parts_arrive() {
        let original = Message {
            role: "user".to_string(),
            content: String::new(),
            parts: vec![MessagePart::Text("caption".to_string()), MessagePart::Image(ImageData {
                bytes: None,
                storage_ref: Some("placeholder".to_string()),
                mime_type: "image/png".to_string(),
                width: 0,
                height: 0,
            })],
            tool_calls: Vec::new(),
            timestamp: 0,
        };
        let original_value = serde_json::to_value(&original).unwrap();

        let processed = Element::new_image(ImageData {
            bytes: Some(vec![9, 9, 9]),
            storage_ref: None,
            mime_type: "image/png".to_string(),
            width: 32,
            height: 32,
        })
        .with_metadata("message_id", "m1")
        .with_metadata("part_index", 1u64)
        .with_metadata("total_parts", 1u64)
        .with_metadata("original_message", original_value);

        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(MediaCompose::new("compose", Duration::from_secs(5))))
            .build()
            .unwrap();

        let out = pipeline.execute_sync(vec![processed]).await.unwrap();
        assert_eq!(out.len(), 1);
        match out[0].content() {
            Some(Content::Message(m)) => match &m.parts[1] {
                MessagePart::Image(image) => assert_eq!(image.width, 32),
                _ => panic!("expected image part"),
            },
            _ => panic!("expected message"),
        }
    }
}
