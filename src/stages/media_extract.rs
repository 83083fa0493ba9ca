//! 1→N fan-out half of the media extract/compose pair: pulls image/video
//! parts out of a message so they can be processed independently
//! downstream, tagging each with enough correlation metadata for
//! [`crate::stages::media_compose::MediaCompose`] to put the message back
//! together later.

use crate::core::context::RunContext;
use crate::element::{Content, Element, Message, MessagePart};
use crate::stage::{Inbound, Outbound, Stage, StageKind};

use async_trait::async_trait;

pub struct MediaExtract {
    name: String,
}

impl MediaExtract {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Stage for MediaExtract {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    async fn run(&self, ctx: RunContext, mut input: Inbound, output: Outbound) -> anyhow::Result<()> {
        while let Some(element) = input.recv(&ctx).await {
            let message = match element.content() {
                Some(Content::Message(m)) => m.clone(),
                _ => {
                    if output.send(&ctx, element).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let message_id = element
                .get_metadata_str("message_id")
                .map(str::to_string)
                .unwrap_or_else(|| element.sequence.to_string());

            let total_parts = message
                .parts
                .iter()
                .filter(|p| matches!(p, MessagePart::Image(_) | MessagePart::Video(_)))
                .count();

            let original_message = serde_json::to_value(&message).unwrap_or(serde_json::Value::Null);

            let mut send_failed = false;
            for (part_index, part) in message.parts.iter().enumerate() {
                let media_element = match part {
                    MessagePart::Image(image) => Some(
                        Element::new_image(image.clone())
                            .with_metadata("media_type", "image"),
                    ),
                    MessagePart::Video(video) => Some(
                        Element::new_video(video.clone())
                            .with_metadata("media_type", "video"),
                    ),
                    MessagePart::Text(text) => {
                        let text_element = Element::new_text(text.clone())
                            .with_metadata("message_id", message_id.clone())
                            .with_metadata("part_index", part_index as u64);
                        if output.send(&ctx, text_element).await.is_err() {
                            send_failed = true;
                        }
                        None
                    }
                };

                if let Some(media_element) = media_element {
                    let tagged = media_element
                        .with_metadata("message_id", message_id.clone())
                        .with_metadata("part_index", part_index as u64)
                        .with_metadata("total_parts", total_parts as u64)
                        .with_metadata("original_message", original_message.clone());
                    if output.send(&ctx, tagged).await.is_err() {
                        send_failed = true;
                    }
                }

                if send_failed {
                    break;
                }
            }
            if send_failed {
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
    use crate::element::ImageData;
    use std::sync::Arc;

    #[tokio::test]
    async fn emits_one_media_element_per_part() {
        let message = Message {
            role: "user".to_string(),
            content: String::new(),
            parts: vec![
                MessagePart::Text("look at this".to_string()),
                MessagePart::Image(ImageData {
                    bytes: Some(vec![1, 2, 3]),
                    storage_ref: None,
                    mime_type: "image/png".to_string(),
                    width: 10,
                    height: 10,
                }),
            ],
            tool_calls: Vec::new(),
            timestamp: 0,
        };

        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(MediaExtract::new("extract")))
            .build()
            .unwrap();

        let out = pipeline
            .execute_sync(vec![Element::new_message(message)])
            .await
            .unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[1].get_metadata("total_parts").and_then(|v| v.as_u64()), Some(1));
    }
}
