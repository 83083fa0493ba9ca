//! N→1 fan-in half of the video-frames pair. Correlates by `video_id` the
//! same way [`crate::stages::media_compose::MediaCompose`] correlates by
//! `message_id`: a `DashMap` keyed accumulator with a periodic timeout
//! sweep.

use crate::core::context::RunContext;
use crate::element::{Content, Element, ImageData, Message, MessagePart};
use crate::stage::{Inbound, Outbound, Stage, StageKind};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FrameSelectionStrategy {
    #[default]
    Uniform,
    First,
    Last,
}

struct Pending {
    frames: std::collections::HashMap<usize, ImageData>,
    total_frames: usize,
    last_update: Instant,
}

fn select_indices(strategy: FrameSelectionStrategy, total: usize, take: usize) -> Vec<usize> {
    if take == 0 || total == 0 {
        return Vec::new();
    }
    match strategy {
        FrameSelectionStrategy::First => (0..total.min(take)).collect(),
        FrameSelectionStrategy::Last => ((total.saturating_sub(take))..total).collect(),
        FrameSelectionStrategy::Uniform => {
            if take >= total {
                return (0..total).collect();
            }
            (0..take)
                .map(|i| i * (total - 1) / (take - 1).max(1))
                .collect()
        }
    }
}

pub struct FramesToMessage {
    name: String,
    completion_timeout: Duration,
    sweep_interval: Duration,
    strategy: FrameSelectionStrategy,
    max_frames_in_message: usize,
}

impl FramesToMessage {
    pub fn new(
        name: impl Into<String>,
        completion_timeout: Duration,
        strategy: FrameSelectionStrategy,
        max_frames_in_message: usize,
    ) -> Self {
        Self {
            name: name.into(),
            completion_timeout,
            sweep_interval: Duration::from_millis(500).min(completion_timeout.max(Duration::from_millis(1))),
            strategy,
            max_frames_in_message,
        }
    }

    fn rebuild(&self, pending: Pending) -> Message {
        let total = pending.total_frames;
        let indices = select_indices(self.strategy, total, self.max_frames_in_message.min(total.max(1)));
        let mut frames = pending.frames;
        let parts = indices
            .into_iter()
            .filter_map(|idx| frames.remove(&idx).map(MessagePart::Image))
            .collect();
        Message {
            role: "assistant".to_string(),
            content: String::new(),
            parts,
            tool_calls: Vec::new(),
            timestamp: crate::core::time::now_millis(),
        }
    }
}

#[async_trait]
impl Stage for FramesToMessage {
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
                    let Some(image) = element.content().and_then(|c| match c {
                        Content::Image(image) => Some(image.clone()),
                        _ => None,
                    }) else {
                        continue;
                    };
                    let Some(video_id) = element.get_metadata_str("video_id").map(str::to_string) else {
                        continue;
                    };
                    let Some(frame_index) = element.get_metadata("frame_index").and_then(|v| v.as_u64()) else {
                        continue;
                    };
                    let total_frames = element.get_metadata("total_frames").and_then(|v| v.as_u64()).unwrap_or(0) as usize;

                    let complete = {
                        let mut entry = pending.entry(video_id.clone()).or_insert_with(|| Pending {
                            frames: std::collections::HashMap::new(),
                            total_frames,
                            last_update: Instant::now(),
                        });
                        entry.frames.insert(frame_index as usize, image);
                        entry.last_update = Instant::now();
                        entry.frames.len() >= entry.total_frames
                    };

                    if complete {
                        if let Some((_, pending_entry)) = pending.remove(&video_id) {
                            let message = self.rebuild(pending_entry);
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
                            tracing::warn!(stage = %self.name, video_id = %key, "composing frames after completion timeout");
                            let message = self.rebuild(pending_entry);
                            if output.send(&ctx, Element::new_message(message)).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }

        for (_, pending_entry) in pending.into_iter() {
            let message = self.rebuild(pending_entry);
            let _ = output.send(&ctx, Element::new_message(message)).await;
        }
        output.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(n: u8) -> ImageData {
        ImageData {
            bytes: Some(vec![n]),
            storage_ref: None,
            mime_type: "image/png".to_string(),
            width: 4,
            height: 4,
        }
    }

    #[tokio::test]
    async fn composes_message_once_all_frames_arrive() {
        let stage = FramesToMessage::new("frames_msg", Duration::from_secs(5), FrameSelectionStrategy::First, 2);
        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(stage))
            .build()
            .unwrap();

        let elements = (0..2)
            .map(|i| {
                Element::new_image(frame(i))
                    .with_metadata("video_id", "v1")
                    .with_metadata("frame_index", i as u64)
                    .with_metadata("total_frames", 2u64)
            })
            .collect();

        let out = pipeline.execute_sync(elements).await.unwrap();
        assert_eq!(out.len(), 1);
        match out[0].content() {
            Some(Content::Message(m)) => assert_eq!(m.parts.len(), 2),
            _ => panic!("expected message"),
        }
    }
}
