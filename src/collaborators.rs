//! Interfaces the core consumes but never implements. Stages that need
//! durable storage, retrieval, speech synthesis, or other world-facing
//! effects take one of these as an injected `Arc<dyn ...>`, the same way
//! the grounding framework's aggregator and output processors take a
//! generic sink rather than owning a concrete backend.
//!
//! No implementation lives here; `src/stages` wires concrete adapters
//! against these traits in example/demo code only.

use crate::core::context::RunContext;
use crate::element::Message;

use async_trait::async_trait;
use std::time::Duration;

/// Opaque reference returned by [`Storage::store`] and accepted by
/// [`Storage::retrieve`]/[`Storage::delete`]/[`Storage::get_url`]. Storage
/// backends are free to encode whatever they need into the string; the
/// core never inspects it.
pub type StorageRef = String;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn store(&self, ctx: &RunContext, content: &[u8], content_type: &str) -> anyhow::Result<StorageRef>;

    async fn retrieve(&self, ctx: &RunContext, reference: &StorageRef) -> anyhow::Result<Vec<u8>>;

    async fn delete(&self, ctx: &RunContext, reference: &StorageRef) -> anyhow::Result<()>;

    async fn get_url(&self, ctx: &RunContext, reference: &StorageRef, expiry: Duration) -> anyhow::Result<String>;
}

/// Durable conversation state keyed by an opaque conversation id. What a
/// "state" is stays abstract here: the state store's native format is
/// whatever the concrete adapter persists to.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    pub conversation_id: String,
    pub messages: Vec<Message>,
    pub summary: Option<String>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, ctx: &RunContext, conversation_id: &str) -> anyhow::Result<Option<ConversationState>>;

    async fn save(&self, ctx: &RunContext, state: &ConversationState) -> anyhow::Result<()>;

    async fn fork(&self, ctx: &RunContext, source_id: &str, dest_id: &str) -> anyhow::Result<()>;
}

/// Optional narrower capability a state store can also expose, so a stage
/// that only needs recent history doesn't have to depend on the full
/// [`StateStore`] surface.
#[async_trait]
pub trait MessageReader: Send + Sync {
    async fn load_recent(&self, ctx: &RunContext, conversation_id: &str, limit: usize) -> anyhow::Result<Vec<Message>>;

    async fn message_count(&self, ctx: &RunContext, conversation_id: &str) -> anyhow::Result<usize>;
}

#[async_trait]
pub trait MessageAppender: Send + Sync {
    async fn append_messages(&self, ctx: &RunContext, conversation_id: &str, messages: &[Message]) -> anyhow::Result<()>;
}

#[async_trait]
pub trait SummaryAccessor: Send + Sync {
    async fn load_summary(&self, ctx: &RunContext, conversation_id: &str) -> anyhow::Result<Option<String>>;

    async fn save_summary(&self, ctx: &RunContext, conversation_id: &str, summary: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub turn_index: u64,
    pub score: f32,
    pub snippet: String,
}

#[async_trait]
pub trait MessageIndex: Send + Sync {
    async fn index(&self, ctx: &RunContext, conversation_id: &str, turn_index: u64, message: &Message) -> anyhow::Result<()>;

    async fn search(&self, ctx: &RunContext, conversation_id: &str, query: &str, k: usize) -> anyhow::Result<Vec<SearchResult>>;

    async fn delete(&self, ctx: &RunContext, conversation_id: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, ctx: &RunContext, messages: &[Message]) -> anyhow::Result<String>;
}

/// Voice-activity state machine observed by the audio-turn accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Quiet,
    Starting,
    Speaking,
    Stopping,
}

#[async_trait]
pub trait VadAnalyzer: Send + Sync {
    /// Feeds one chunk of PCM samples and returns a speech-likelihood score
    /// in `0.0..=1.0`.
    async fn analyze(&self, ctx: &RunContext, samples: &[i16]) -> anyhow::Result<f32>;

    fn state(&self) -> VadState;

    fn reset(&self);

    /// Fires once per transition, not once per `analyze` call.
    async fn on_state_change(&self) -> VadState;
}

/// A duplex session with a model provider: text/audio chunks go in, a
/// stream of response chunks comes out. Used by duplex stages that need to
/// interleave sending with receiving rather than a simple request/response
/// call. `Interrupted`/`TurnComplete` are turn-boundary markers, not
/// content; a turn's text arrives as zero or more `Content` deltas before
/// one of the two boundary chunks.
#[derive(Debug, Clone)]
pub enum ProviderChunk {
    Content(String),
    Audio(Vec<u8>),
    Image(crate::element::ImageData),
    Video(crate::element::VideoData),
    ToolCall(crate::element::ToolCall),
    Interrupted,
    TurnComplete,
}

#[async_trait]
pub trait ProviderSession: Send + Sync {
    async fn send_chunk(&self, ctx: &RunContext, chunk: ProviderChunk) -> anyhow::Result<()>;

    async fn send_text(&self, ctx: &RunContext, text: &str) -> anyhow::Result<()>;

    /// Returns `None` once the provider has closed its side.
    async fn receive(&self, ctx: &RunContext) -> Option<ProviderChunk>;

    async fn close(&self);
}

#[derive(Debug, Clone, Default)]
pub struct TtsConfig {
    pub voice: Option<String>,
    pub sample_rate_hz: u32,
}

#[async_trait]
pub trait TtsService: Send + Sync {
    /// Synthesized audio arrives as a stream of PCM chunks rather than one
    /// buffer, so a duplex stage can start playback before the whole
    /// utterance finishes synthesizing.
    async fn synthesize(&self, ctx: &RunContext, text: &str, config: &TtsConfig) -> anyhow::Result<tokio::sync::mpsc::Receiver<Vec<u8>>>;
}
