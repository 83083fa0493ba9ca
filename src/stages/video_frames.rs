//! 1→N fan-out half of the video-frames pair: runs an external frame
//! extractor over each video element and emits one image element per
//! frame. What actually invokes ffmpeg (or similar) is an injected
//! closure-shaped collaborator, not specified here, the same way `Storage`
//! and the other collaborator traits leave their backend unspecified.

use crate::core::context::RunContext;
use crate::element::{Content, Element, ImageData};
use crate::stage::{Inbound, Outbound, Stage, StageKind};

use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FrameSamplingMode {
    #[default]
    Interval,
    Keyframes,
    Fps,
}

/// Extracts still frames from a video. Kept separate from [`VideoFrames`]
/// so tests can stub it without invoking a real media tool.
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn extract(
        &self,
        ctx: &RunContext,
        video_id: &str,
        mode: FrameSamplingMode,
        max_frames: usize,
    ) -> anyhow::Result<Vec<ImageData>>;
}

pub struct VideoFrames {
    name: String,
    extractor: std::sync::Arc<dyn FrameExtractor>,
    mode: FrameSamplingMode,
    max_frames: usize,
}

impl VideoFrames {
    pub fn new(
        name: impl Into<String>,
        extractor: std::sync::Arc<dyn FrameExtractor>,
        mode: FrameSamplingMode,
        max_frames: usize,
    ) -> Self {
        Self {
            name: name.into(),
            extractor,
            mode,
            max_frames,
        }
    }
}

#[async_trait]
impl Stage for VideoFrames {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    async fn run(&self, ctx: RunContext, mut input: Inbound, output: Outbound) -> anyhow::Result<()> {
        while let Some(element) = input.recv(&ctx).await {
            let video = match element.content() {
                Some(Content::Video(video)) => video.clone(),
                _ => {
                    if output.send(&ctx, element).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let video_id = element
                .get_metadata_str("video_id")
                .map(str::to_string)
                .unwrap_or_else(|| element.sequence.to_string());

            let frames = match self.extractor.extract(&ctx, &video_id, self.mode, self.max_frames).await {
                Ok(frames) => frames,
                Err(err) => {
                    tracing::warn!(stage = %self.name, error = %err, "frame extraction failed");
                    if output.send(&ctx, Element::new_error(err.to_string())).await.is_err() {
                        break;
                    }
                    continue;
                }
            };
            let total_frames = frames.len();
            let original_video = serde_json::to_value(&video).unwrap_or(serde_json::Value::Null);

            let mut send_failed = false;
            for (frame_index, frame) in frames.into_iter().enumerate() {
                let tagged = Element::new_image(frame)
                    .with_metadata("video_id", video_id.clone())
                    .with_metadata("frame_index", frame_index as u64)
                    .with_metadata("total_frames", total_frames as u64)
                    .with_metadata("original_video", original_video.clone());
                if output.send(&ctx, tagged).await.is_err() {
                    send_failed = true;
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
    use crate::element::VideoData;
    use std::sync::Arc;

    struct FixedExtractor;

    #[async_trait]
    impl FrameExtractor for FixedExtractor {
        async fn extract(
            &self,
            _ctx: &RunContext,
            _video_id: &str,
            _mode: FrameSamplingMode,
            max_frames: usize,
        ) -> anyhow::Result<Vec<ImageData>> {
            Ok((0..max_frames.min(3))
                .map(|i| ImageData {
                    bytes: Some(vec![i as u8]),
                    storage_ref: None,
                    mime_type: "image/png".to_string(),
                    width: 8,
                    height: 8,
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn emits_one_image_per_frame() {
        let stage = VideoFrames::new("frames", Arc::new(FixedExtractor), FrameSamplingMode::Fps, 5);
        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(stage))
            .build()
            .unwrap();

        let video = Element::new_video(VideoData {
            bytes: None,
            storage_ref: Some("ref".to_string()),
            mime_type: "video/mp4".to_string(),
            width: 640,
            height: 480,
            framerate: 30.0,
            duration_ms: 1000,
            is_keyframe: false,
        });

        let out = pipeline.execute_sync(vec![video]).await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].get_metadata("total_frames").and_then(|v| v.as_u64()), Some(3));
    }
}
