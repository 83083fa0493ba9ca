//! The one bidirectional stage the runtime allows per pipeline: reads the
//! inbound edge into a provider session while concurrently draining the
//! session's response stream into the outbound edge.
//!
//! Unlike the fan-in stages elsewhere in this module, the two directions
//! here are not merged into one recv loop with
//! [`crate::topology::merge::merge_inbound`] — they have no shared output
//! to race on selection order, just a shared `Arc`-cloned outbound port, so
//! two plain tokio tasks joined at the end of `run` are simpler and do not
//! need tagging.

use crate::collaborators::{ProviderChunk, ProviderSession};
use crate::core::context::RunContext;
use crate::element::{Content, Element, Message};
use crate::stage::{Inbound, Outbound, Stage, StageKind};

use async_trait::async_trait;
use std::sync::Arc;

/// Opens a provider session once the first element's `system_prompt`
/// metadata is known. Kept separate from [`ProviderSession`] because
/// opening is a one-shot setup step, not part of the session's duplex
/// contract.
#[async_trait]
pub trait SessionOpener: Send + Sync {
    async fn open(&self, ctx: &RunContext, system_prompt: &str) -> anyhow::Result<Arc<dyn ProviderSession>>;
}

pub struct DuplexProvider {
    name: String,
    opener: Arc<dyn SessionOpener>,
}

impl DuplexProvider {
    pub fn new(name: impl Into<String>, opener: Arc<dyn SessionOpener>) -> Self {
        Self {
            name: name.into(),
            opener,
        }
    }
}

/// Forwards one element to the session unless it is a user-role message, in
/// which case it is handed back to the caller to forward to `output`
/// instead (so a downstream sink can persist it).
async fn forward_to_session(ctx: &RunContext, session: &Arc<dyn ProviderSession>, element: Element) -> Option<Element> {
    if let Some(Content::Message(message)) = element.content() {
        if message.role == "user" {
            return Some(element);
        }
    }
    match element.content() {
        Some(Content::Text(text)) if !text.is_empty() => {
            let _ = session.send_text(ctx, text).await;
        }
        Some(Content::Audio(audio)) if !audio.samples.is_empty() => {
            let _ = session.send_chunk(ctx, ProviderChunk::Audio(audio.samples.clone())).await;
        }
        Some(Content::Image(image)) if image.bytes.is_some() => {
            let _ = session.send_chunk(ctx, ProviderChunk::Image(image.clone())).await;
        }
        Some(Content::Video(video)) if video.bytes.is_some() => {
            let _ = session.send_chunk(ctx, ProviderChunk::Video(video.clone())).await;
        }
        _ => {}
    }
    None
}

async fn upstream_pump(ctx: RunContext, mut input: Inbound, output: Outbound, session: Arc<dyn ProviderSession>, first: Option<Element>) {
    if let Some(element) = first {
        if let Some(user_message) = forward_to_session(&ctx, &session, element).await {
            let _ = output.send(&ctx, user_message).await;
        }
    }

    while let Some(element) = input.recv(&ctx).await {
        if let Some(user_message) = forward_to_session(&ctx, &session, element).await {
            if output.send(&ctx, user_message).await.is_err() {
                break;
            }
        }
    }

    session.close().await;
}

async fn downstream_pump(ctx: RunContext, output: Outbound, session: Arc<dyn ProviderSession>) {
    let mut accumulated = String::new();
    let mut interrupted_turn = false;

    while let Some(chunk) = session.receive(&ctx).await {
        match chunk {
            ProviderChunk::Content(text) => accumulated.push_str(&text),
            ProviderChunk::Audio(bytes) => {
                let audio_element = Element::new_audio(crate::element::AudioData {
                    samples: bytes,
                    sample_rate: 24_000,
                    channels: 1,
                    encoding: "pcm16".to_string(),
                })
                .with_metadata("streaming", true);
                if output.send(&ctx, audio_element).await.is_err() {
                    return;
                }
            }
            ProviderChunk::Image(image) => {
                if output.send(&ctx, Element::new_image(image)).await.is_err() {
                    return;
                }
            }
            ProviderChunk::Video(video) => {
                if output.send(&ctx, Element::new_video(video)).await.is_err() {
                    return;
                }
            }
            ProviderChunk::ToolCall(call) => {
                if output.send(&ctx, Element::new_tool_call(call)).await.is_err() {
                    return;
                }
            }
            ProviderChunk::Interrupted => {
                if !accumulated.is_empty() {
                    let message = assistant_message(std::mem::take(&mut accumulated));
                    let element = Element::new_message(message)
                        .with_metadata("finish_reason", "interrupted")
                        .with_metadata("is_partial", true);
                    if output.send(&ctx, element).await.is_err() {
                        return;
                    }
                }
                interrupted_turn = true;
            }
            ProviderChunk::TurnComplete => {
                if interrupted_turn && accumulated.is_empty() {
                    let element = Element::new_text(String::new())
                        .with_metadata("interrupted_turn_complete", true);
                    if output.send(&ctx, element).await.is_err() {
                        return;
                    }
                    interrupted_turn = false;
                    continue;
                }

                if !accumulated.is_empty() {
                    let message = assistant_message(std::mem::take(&mut accumulated));
                    let element = Element::new_message(message).with_metadata("finish_reason", "complete");
                    if output.send(&ctx, element).await.is_err() {
                        return;
                    }
                }
                if output.send(&ctx, Element::new_end_of_stream()).await.is_err() {
                    return;
                }
                interrupted_turn = false;
            }
        }
    }
}

fn assistant_message(content: String) -> Message {
    Message {
        role: "assistant".to_string(),
        content,
        parts: Vec::new(),
        tool_calls: Vec::new(),
        timestamp: crate::core::time::now_millis(),
    }
}

#[async_trait]
impl Stage for DuplexProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Bidirectional
    }

    async fn run(&self, ctx: RunContext, mut input: Inbound, output: Outbound) -> anyhow::Result<()> {
        let first = input.recv(&ctx).await;
        let Some(first) = first else {
            output.close();
            return Ok(());
        };

        let system_prompt = first.get_metadata_str("system_prompt").unwrap_or("").to_string();
        let session = self.opener.open(&ctx, &system_prompt).await?;

        let upstream_ctx = ctx.clone();
        let upstream_output = output.clone();
        let upstream_session = session.clone();
        let upstream = tokio::spawn(upstream_pump(upstream_ctx, input, upstream_output, upstream_session, Some(first)));

        let downstream_ctx = ctx.clone();
        let downstream_output = output.clone();
        let downstream = tokio::spawn(downstream_pump(downstream_ctx, downstream_output, session));

        let _ = tokio::join!(upstream, downstream);
        output.close();
        Ok(())
    }
}
