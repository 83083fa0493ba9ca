//! Synthesizes speech for text/message elements, coordinating with an
//! audio-turn accumulator through a shared [`InterruptionState`] so a
//! barge-in interrupt discards speech the bot has not finished saying yet.

use crate::collaborators::{TtsConfig, TtsService};
use crate::core::context::RunContext;
use crate::element::{AudioData, Element};
use crate::stage::{Inbound, Outbound, Stage, StageKind};
use crate::stages::interruption::InterruptionState;

use async_trait::async_trait;
use std::sync::Arc;

pub struct InterruptibleTts {
    name: String,
    tts: Arc<dyn TtsService>,
    interruption: Arc<InterruptionState>,
    min_text_length: usize,
    config: TtsConfig,
}

impl InterruptibleTts {
    pub fn new(
        name: impl Into<String>,
        tts: Arc<dyn TtsService>,
        interruption: Arc<InterruptionState>,
        min_text_length: usize,
        config: TtsConfig,
    ) -> Self {
        Self {
            name: name.into(),
            tts,
            interruption,
            min_text_length,
            config,
        }
    }
}

#[async_trait]
impl Stage for InterruptibleTts {
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

            let text = element.extract_text();
            let below_threshold = text
                .as_ref()
                .map(|t| t.len() < self.min_text_length)
                .unwrap_or(true);
            if below_threshold {
                if output.send(&ctx, element).await.is_err() {
                    break;
                }
                continue;
            }
            let text = text.unwrap();

            self.interruption.set_bot_speaking(true);

            if self.interruption.take_interrupted() {
                tracing::debug!(stage = %self.name, "skipping synthesis, preceding interruption");
                self.interruption.set_bot_speaking(false);
                continue;
            }

            let synthesized = self.tts.synthesize(&ctx, &text, &self.config).await;
            let mut audio_bytes = Vec::new();
            let mut synthesis_error = None;
            match synthesized {
                Ok(mut chunks) => {
                    while let Some(chunk) = chunks.recv().await {
                        audio_bytes.extend(chunk);
                    }
                }
                Err(err) => synthesis_error = Some(err),
            }

            let result = if let Some(err) = synthesis_error {
                tracing::warn!(stage = %self.name, error = %err, "synthesis failed");
                let mut error_element = Element::new_error(err.to_string());
                error_element.metadata = element.metadata.clone();
                error_element.source = element.source.clone();
                Some(error_element)
            } else if self.interruption.take_interrupted() {
                tracing::debug!(stage = %self.name, "discarding synthesized audio, interrupted mid-speech");
                None
            } else {
                let mut audio_element = Element::new_audio(AudioData {
                    samples: audio_bytes,
                    sample_rate: self.config.sample_rate_hz,
                    channels: 1,
                    encoding: "pcm16".to_string(),
                });
                audio_element.metadata = element.metadata.clone();
                audio_element.source = element.source.clone();
                Some(
                    audio_element
                        .with_metadata("text", text)
                        .with_metadata("spoken", true),
                )
            };

            self.interruption.set_bot_speaking(false);

            if let Some(emitted) = result {
                if output.send(&ctx, emitted).await.is_err() {
                    break;
                }
            }
        }
        output.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTts;

    #[async_trait]
    impl TtsService for EchoTts {
        async fn synthesize(
            &self,
            _ctx: &RunContext,
            text: &str,
            _config: &TtsConfig,
        ) -> anyhow::Result<tokio::sync::mpsc::Receiver<Vec<u8>>> {
            let (tx, rx) = tokio::sync::mpsc::channel(4);
            let bytes = text.as_bytes().to_vec();
            tokio::spawn(async move {
                let _ = tx.send(bytes).await;
            });
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn short_text_passes_through_unsynthesized() {
        let stage = InterruptibleTts::new(
            "tts",
            Arc::new(EchoTts),
            Arc::new(InterruptionState::new()),
            100,
            TtsConfig::default(),
        );
        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(stage))
            .build()
            .unwrap();

        let out = pipeline
            .execute_sync(vec![Element::new_text("hi")])
            .await
            .unwrap();
        assert_eq!(out[0].extract_text().as_deref(), Some("hi"));
    }

    struct FailingTts;

    #[async_trait]
    impl TtsService for FailingTts {
        async fn synthesize(
            &self,
            _ctx: &RunContext,
            _text: &str,
            _config: &TtsConfig,
        ) -> anyhow::Result<tokio::sync::mpsc::Receiver<Vec<u8>>> {
            Err(anyhow::anyhow!("voice backend unavailable"))
        }
    }

    #[tokio::test]
    async fn synthesis_failure_forwards_an_error_element_preserving_metadata() {
        let stage = InterruptibleTts::new(
            "tts",
            Arc::new(FailingTts),
            Arc::new(InterruptionState::new()),
            2,
            TtsConfig::default(),
        );
        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(stage))
            .build()
            .unwrap();

        let input = Element::new_text("hello there").with_metadata("turn_id", 7);
        let out = pipeline.execute_sync(vec![input]).await.unwrap();

        assert_eq!(out.len(), 1);
        assert!(out[0].is_control());
        assert!(out[0].error().unwrap().contains("voice backend unavailable"));
        assert_eq!(out[0].get_metadata("turn_id").and_then(|v| v.as_i64()), Some(7));
    }

    #[tokio::test]
    async fn long_text_is_synthesized_and_clears_bot_speaking() {
        let interruption = Arc::new(InterruptionState::new());
        let stage = InterruptibleTts::new(
            "tts",
            Arc::new(EchoTts),
            interruption.clone(),
            2,
            TtsConfig::default(),
        );
        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(stage))
            .build()
            .unwrap();

        let input = Element::new_text("hello there").with_metadata("turn_id", 3);
        let out = pipeline.execute_sync(vec![input]).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_metadata_str("text"), Some("hello there"));
        assert_eq!(out[0].get_metadata("turn_id").and_then(|v| v.as_i64()), Some(3));
        assert!(!interruption.is_bot_speaking());
    }
}
