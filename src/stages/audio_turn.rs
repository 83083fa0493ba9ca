//! Buffers audio chunks into complete speech turns using an injected VAD.
//!
//! Non-audio elements pass through untouched; they are not part of the
//! turn-boundary decision. A turn detector is an optional local refinement
//! this crate adds on top of the VAD's four states: the collaborator
//! contracts only specify the VAD, so `TurnDetector` is not part of
//! `crate::collaborators` and is defined here instead.

use crate::collaborators::VadAnalyzer;
use crate::core::context::RunContext;
use crate::element::{AudioData, Content, Element};
use crate::stage::{Inbound, Outbound, Stage, StageKind};
use crate::stages::interruption::InterruptionState;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reports whether the speaker is still actively talking, independent of
/// the VAD's own instantaneous classification. Optional; when absent, only
/// silence duration and max-turn duration can end a turn.
pub trait TurnDetector: Send + Sync {
    fn is_speaking(&self) -> bool;
}

pub struct AudioTurnAccumulator {
    name: String,
    vad: Arc<dyn VadAnalyzer>,
    turn_detector: Option<Arc<dyn TurnDetector>>,
    interruption: Option<Arc<InterruptionState>>,
    min_speech_duration: Duration,
    silence_duration: Duration,
    max_turn_duration: Duration,
}

impl AudioTurnAccumulator {
    pub fn new(
        name: impl Into<String>,
        vad: Arc<dyn VadAnalyzer>,
        min_speech_duration: Duration,
        silence_duration: Duration,
        max_turn_duration: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            vad,
            turn_detector: None,
            interruption: None,
            min_speech_duration,
            silence_duration,
            max_turn_duration,
        }
    }

    pub fn with_turn_detector(mut self, detector: Arc<dyn TurnDetector>) -> Self {
        self.turn_detector = Some(detector);
        self
    }

    pub fn with_interruption(mut self, interruption: Arc<InterruptionState>) -> Self {
        self.interruption = Some(interruption);
        self
    }
}

fn pcm16_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Turn-in-progress buffer. Lives entirely inside `run`'s stack, since a
/// single task owns it for the lifetime of the stage.
struct TurnBuffer {
    samples: Vec<u8>,
    sample_rate: u32,
    channels: u16,
    encoding: String,
    speech_start: Instant,
    silence_start: Option<Instant>,
}

#[async_trait]
impl Stage for AudioTurnAccumulator {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Accumulate
    }

    async fn run(&self, ctx: RunContext, mut input: Inbound, output: Outbound) -> anyhow::Result<()> {
        let mut turn: Option<TurnBuffer> = None;

        while let Some(element) = input.recv(&ctx).await {
            if element.is_control() {
                if output.send(&ctx, element).await.is_err() {
                    break;
                }
                continue;
            }

            let audio = match element.content() {
                Some(Content::Audio(audio)) => audio.clone(),
                _ => {
                    if output.send(&ctx, element).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            if let Some(interruption) = &self.interruption {
                if interruption.take_interrupted() {
                    tracing::debug!(stage = %self.name, "turn discarded due to interruption");
                    turn = None;
                }
            }

            let score = self.vad.analyze(&ctx, &pcm16_samples(&audio.samples)).await?;
            let state = self.vad.state();
            tracing::debug!(stage = %self.name, ?state, score, "vad classified chunk");

            use crate::collaborators::VadState::*;
            match state {
                Starting | Speaking => {
                    let buf = turn.get_or_insert_with(|| TurnBuffer {
                        samples: Vec::new(),
                        sample_rate: audio.sample_rate,
                        channels: audio.channels,
                        encoding: audio.encoding.clone(),
                        speech_start: Instant::now(),
                        silence_start: None,
                    });
                    buf.samples.extend_from_slice(&audio.samples);
                    buf.silence_start = None;
                }
                Stopping | Quiet => {
                    if let Some(buf) = turn.as_mut() {
                        buf.samples.extend_from_slice(&audio.samples);
                        buf.silence_start.get_or_insert_with(Instant::now);
                    }
                }
            }

            let not_speaking = self
                .turn_detector
                .as_ref()
                .map(|d| !d.is_speaking())
                .unwrap_or(false);

            let complete = turn.as_ref().is_some_and(|buf| {
                buf.speech_start.elapsed() >= self.min_speech_duration
                    && (buf
                        .silence_start
                        .is_some_and(|s| s.elapsed() >= self.silence_duration)
                        || buf.speech_start.elapsed() >= self.max_turn_duration
                        || not_speaking)
            });

            if complete {
                let buf = turn.take().unwrap();
                let emitted = Element::new_audio(AudioData {
                    samples: buf.samples,
                    sample_rate: buf.sample_rate,
                    channels: buf.channels,
                    encoding: buf.encoding,
                })
                .with_metadata("turn_complete", true);
                if output.send(&ctx, emitted).await.is_err() {
                    break;
                }
            }
        }

        if let Some(buf) = turn {
            let emitted = Element::new_audio(AudioData {
                samples: buf.samples,
                sample_rate: buf.sample_rate,
                channels: buf.channels,
                encoding: buf.encoding,
            })
            .with_metadata("turn_complete", true);
            let _ = output.send(&ctx, emitted).await;
        }

        output.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::VadState;
    use parking_lot::Mutex;

    struct ScriptedVad {
        states: Mutex<Vec<VadState>>,
        current: Mutex<VadState>,
    }

    #[async_trait]
    impl VadAnalyzer for ScriptedVad {
        async fn analyze(&self, _ctx: &RunContext, _samples: &[i16]) -> anyhow::Result<f32> {
            let mut states = self.states.lock();
            if !states.is_empty() {
                *self.current.lock() = states.remove(0);
            }
            Ok(1.0)
        }

        fn state(&self) -> VadState {
            *self.current.lock()
        }

        fn reset(&self) {}

        async fn on_state_change(&self) -> VadState {
            self.state()
        }
    }

    #[tokio::test]
    async fn flushes_in_progress_turn_on_input_close() {
        let vad = Arc::new(ScriptedVad {
            states: Mutex::new(vec![VadState::Speaking]),
            current: Mutex::new(VadState::Quiet),
        });
        let accumulator = AudioTurnAccumulator::new(
            "turns",
            vad,
            Duration::from_millis(0),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );

        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(accumulator))
            .build()
            .unwrap();

        let chunk = Element::new_audio(AudioData {
            samples: vec![0, 0, 1, 0],
            sample_rate: 16_000,
            channels: 1,
            encoding: "pcm16".to_string(),
        });

        let out = pipeline.execute_sync(vec![chunk]).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_metadata("turn_complete").and_then(|v| v.as_bool()), Some(true));
    }
}
