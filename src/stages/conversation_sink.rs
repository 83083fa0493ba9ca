//! Collects newly produced messages while forwarding everything
//! unchanged, then persists them through a [`StateStore`] on input close,
//! optionally indexing and auto-summarizing. All of this happens at
//! stream-end rather than per-element, so a single conversation-sink stage
//! can sit at the very end of a pipeline without slowing the hot path.

use crate::collaborators::{
    ConversationState, MessageAppender, MessageIndex, MessageReader, StateStore, SummaryAccessor, Summarizer,
};
use crate::core::context::RunContext;
use crate::element::{Content, Element, Message};
use crate::stage::{Inbound, Outbound, Stage, StageKind};

use async_trait::async_trait;
use std::sync::Arc;

/// Sources already present in persisted history or derived from it; their
/// messages are not "newly produced" and must not be re-persisted.
const ALREADY_PERSISTED_SOURCES: &[&str] = &["statestore", "summary", "retrieved"];

/// `SummaryAccessor::save_summary` only has room for the summary text
/// itself; the turn index it was computed through rides along as a prefix
/// so `persist` can tell how much new material has accumulated since,
/// without a parallel storage call.
fn encode_summary_cursor(last_turn: u64, text: &str) -> String {
    format!("{last_turn}\u{1}{text}")
}

fn decode_summary_cursor(raw: &str) -> (u64, String) {
    match raw.split_once('\u{1}') {
        Some((turn, text)) => (turn.parse().unwrap_or(0), text.to_string()),
        None => (0, raw.to_string()),
    }
}

pub struct ConversationSink {
    name: String,
    conversation_id: String,
    state_store: Arc<dyn StateStore>,
    appender: Option<(Arc<dyn MessageAppender>, Arc<dyn MessageReader>)>,
    index: Option<Arc<dyn MessageIndex>>,
    summarizer: Option<(Arc<dyn Summarizer>, Arc<dyn SummaryAccessor>)>,
    summary_batch_size: usize,
}

impl ConversationSink {
    pub fn new(
        name: impl Into<String>,
        conversation_id: impl Into<String>,
        state_store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            name: name.into(),
            conversation_id: conversation_id.into(),
            state_store,
            appender: None,
            index: None,
            summarizer: None,
            summary_batch_size: 20,
        }
    }

    /// `reader` is required alongside `appender` so `persist` can compute
    /// the starting turn index through `MessageReader::message_count`
    /// instead of a full `StateStore::load`.
    pub fn with_appender(mut self, appender: Arc<dyn MessageAppender>, reader: Arc<dyn MessageReader>) -> Self {
        self.appender = Some((appender, reader));
        self
    }

    pub fn with_index(mut self, index: Arc<dyn MessageIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// `accessor` holds the summary text (and its progress cursor) apart
    /// from the generic conversation state, so summarizing doesn't require
    /// a full `StateStore::save` of every message just to update one field.
    pub fn with_summarizer(
        mut self,
        summarizer: Arc<dyn Summarizer>,
        accessor: Arc<dyn SummaryAccessor>,
        batch_size: usize,
    ) -> Self {
        self.summarizer = Some((summarizer, accessor));
        self.summary_batch_size = batch_size;
        self
    }

    async fn persist(&self, ctx: &RunContext, newly_produced: Vec<Message>) -> anyhow::Result<()> {
        if newly_produced.is_empty() {
            return Ok(());
        }

        let start_turn_index = if let Some((appender, reader)) = &self.appender {
            let existing = reader.message_count(ctx, &self.conversation_id).await?;
            appender
                .append_messages(ctx, &self.conversation_id, &newly_produced)
                .await?;
            existing
        } else {
            let mut state = self
                .state_store
                .load(ctx, &self.conversation_id)
                .await?
                .unwrap_or_else(|| ConversationState {
                    conversation_id: self.conversation_id.clone(),
                    ..Default::default()
                });
            let start = state.messages.len();
            state.messages.extend(newly_produced.clone());
            self.state_store.save(ctx, &state).await?;
            start
        };

        if let Some(index) = &self.index {
            for (offset, message) in newly_produced.iter().enumerate() {
                let turn_index = (start_turn_index + offset) as u64;
                if let Err(err) = index.index(ctx, &self.conversation_id, turn_index, message).await {
                    tracing::warn!(stage = %self.name, error = %err, "message indexing failed");
                }
            }
        }

        if let Some((summarizer, accessor)) = &self.summarizer {
            let total_count = (start_turn_index + newly_produced.len()) as u64;
            if total_count >= self.summary_batch_size as u64 {
                let last_summarized = match accessor.load_summary(ctx, &self.conversation_id).await {
                    Ok(Some(raw)) => decode_summary_cursor(&raw).0,
                    Ok(None) => 0,
                    Err(err) => {
                        tracing::warn!(stage = %self.name, error = %err, "summary cursor reload failed");
                        0
                    }
                };

                if total_count.saturating_sub(last_summarized) >= self.summary_batch_size as u64 {
                    match self.state_store.load(ctx, &self.conversation_id).await {
                        Ok(Some(state)) => match summarizer.summarize(ctx, &state.messages).await {
                            Ok(summary) => {
                                let encoded = encode_summary_cursor(total_count, &summary);
                                if let Err(err) = accessor.save_summary(ctx, &self.conversation_id, &encoded).await {
                                    tracing::warn!(stage = %self.name, error = %err, "summary persistence failed");
                                }
                            }
                            Err(err) => {
                                tracing::warn!(stage = %self.name, error = %err, "summarization failed");
                            }
                        },
                        Ok(None) => {}
                        Err(err) => tracing::warn!(stage = %self.name, error = %err, "state reload before summarization failed"),
                    }
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Stage for ConversationSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Sink
    }

    async fn run(&self, ctx: RunContext, mut input: Inbound, output: Outbound) -> anyhow::Result<()> {
        let mut collected: Vec<(String, Message)> = Vec::new();

        while let Some(element) = input.recv(&ctx).await {
            if let Some(Content::Message(message)) = element.content() {
                collected.push((element.source.clone(), message.clone()));
            }
            if output.send(&ctx, element).await.is_err() {
                break;
            }
        }

        let newly_produced: Vec<Message> = collected
            .into_iter()
            .filter(|(source, _)| !ALREADY_PERSISTED_SOURCES.contains(&source.as_str()))
            .map(|(_, message)| message)
            .collect();

        if let Err(err) = self.persist(&ctx, newly_produced).await {
            tracing::error!(stage = %self.name, error = %err, "conversation persistence failed");
        }

        output.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct InMemoryStore {
        state: Mutex<Option<ConversationState>>,
    }

    #[async_trait]
    impl StateStore for InMemoryStore {
        async fn load(&self, _ctx: &RunContext, conversation_id: &str) -> anyhow::Result<Option<ConversationState>> {
            let state = self.state.lock();
            Ok(state.clone().filter(|s| s.conversation_id == conversation_id))
        }

        async fn save(&self, _ctx: &RunContext, state: &ConversationState) -> anyhow::Result<()> {
            *self.state.lock() = Some(state.clone());
            Ok(())
        }

        async fn fork(&self, _ctx: &RunContext, _source_id: &str, _dest_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn persists_newly_produced_messages_and_forwards_everything() {
        let store = Arc::new(InMemoryStore::default());
        let sink = ConversationSink::new("sink", "conv-1", store.clone());

        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(sink))
            .build()
            .unwrap();

        let message = Message {
            role: "assistant".to_string(),
            content: "hi there".to_string(),
            parts: Vec::new(),
            tool_calls: Vec::new(),
            timestamp: 0,
        };

        let out = pipeline
            .execute_sync(vec![Element::new_message(message).with_source("provider")])
            .await
            .unwrap();

        assert_eq!(out.len(), 1);
        let saved = store.state.lock().clone().unwrap();
        assert_eq!(saved.messages.len(), 1);
    }

    #[tokio::test]
    async fn does_not_repersist_statestore_sourced_messages() {
        let store = Arc::new(InMemoryStore::default());
        let sink = ConversationSink::new("sink", "conv-1", store.clone());

        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(sink))
            .build()
            .unwrap();

        let message = Message {
            role: "user".to_string(),
            content: "old history".to_string(),
            parts: Vec::new(),
            tool_calls: Vec::new(),
            timestamp: 0,
        };

        pipeline
            .execute_sync(vec![Element::new_message(message).with_source("statestore")])
            .await
            .unwrap();

        assert!(store.state.lock().is_none());
    }

    struct PanicsOnLoadStore;

    #[async_trait]
    impl StateStore for PanicsOnLoadStore {
        async fn load(&self, _ctx: &RunContext, _conversation_id: &str) -> anyhow::Result<Option<ConversationState>> {
            panic!("persist() must not call StateStore::load when an appender is configured");
        }

        async fn save(&self, _ctx: &RunContext, _state: &ConversationState) -> anyhow::Result<()> {
            panic!("append mode never calls StateStore::save either");
        }

        async fn fork(&self, _ctx: &RunContext, _source_id: &str, _dest_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingAppender {
        appended: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl MessageAppender for RecordingAppender {
        async fn append_messages(&self, _ctx: &RunContext, _conversation_id: &str, messages: &[Message]) -> anyhow::Result<()> {
            self.appended.lock().extend_from_slice(messages);
            Ok(())
        }
    }

    struct FixedCountReader(usize);

    #[async_trait]
    impl MessageReader for FixedCountReader {
        async fn load_recent(&self, _ctx: &RunContext, _conversation_id: &str, _limit: usize) -> anyhow::Result<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn message_count(&self, _ctx: &RunContext, _conversation_id: &str) -> anyhow::Result<usize> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn append_mode_uses_message_count_and_never_calls_load() {
        let appender = Arc::new(RecordingAppender::default());
        let sink = ConversationSink::new("sink", "conv-1", Arc::new(PanicsOnLoadStore))
            .with_appender(appender.clone(), Arc::new(FixedCountReader(5)));

        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(sink))
            .build()
            .unwrap();

        let message = Message {
            role: "assistant".to_string(),
            content: "hi there".to_string(),
            parts: Vec::new(),
            tool_calls: Vec::new(),
            timestamp: 0,
        };
        pipeline
            .execute_sync(vec![Element::new_message(message).with_source("provider")])
            .await
            .unwrap();

        assert_eq!(appender.appended.lock().len(), 1);
    }

    #[derive(Default)]
    struct FakeSummarizer {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Summarizer for FakeSummarizer {
        async fn summarize(&self, _ctx: &RunContext, messages: &[Message]) -> anyhow::Result<String> {
            *self.calls.lock() += 1;
            Ok(format!("summary of {} messages", messages.len()))
        }
    }

    #[derive(Default)]
    struct FakeSummaryAccessor {
        stored: Mutex<Option<String>>,
    }

    #[async_trait]
    impl SummaryAccessor for FakeSummaryAccessor {
        async fn load_summary(&self, _ctx: &RunContext, _conversation_id: &str) -> anyhow::Result<Option<String>> {
            Ok(self.stored.lock().clone())
        }

        async fn save_summary(&self, _ctx: &RunContext, _conversation_id: &str, summary: &str) -> anyhow::Result<()> {
            *self.stored.lock() = Some(summary.to_string());
            Ok(())
        }
    }

    fn assistant(text: &str) -> Message {
        Message {
            role: "assistant".to_string(),
            content: text.to_string(),
            parts: Vec::new(),
            tool_calls: Vec::new(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn summary_cursor_tracks_progress_instead_of_resetting_to_zero() {
        let store = Arc::new(InMemoryStore::default());
        let summarizer = Arc::new(FakeSummarizer::default());
        let accessor = Arc::new(FakeSummaryAccessor::default());
        let sink = ConversationSink::new("sink", "conv-1", store.clone())
            .with_summarizer(summarizer.clone(), accessor.clone(), 3);

        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(sink))
            .build()
            .unwrap();

        // First three messages cross the batch threshold: summarize once.
        pipeline
            .execute_sync(vec![
                Element::new_message(assistant("a")).with_source("provider"),
                Element::new_message(assistant("b")).with_source("provider"),
                Element::new_message(assistant("c")).with_source("provider"),
            ])
            .await
            .unwrap();
        assert_eq!(*summarizer.calls.lock(), 1);
        let (cursor, _) = decode_summary_cursor(&accessor.stored.lock().clone().unwrap());
        assert_eq!(cursor, 3);

        // One more message keeps total_count above batch_size, but the
        // cursor means there isn't a fresh full batch yet: must not re-fire.
        pipeline
            .execute_sync(vec![Element::new_message(assistant("d")).with_source("provider")])
            .await
            .unwrap();
        assert_eq!(*summarizer.calls.lock(), 1);

        // Two more complete a fresh batch of 3 unsummarized turns.
        pipeline
            .execute_sync(vec![
                Element::new_message(assistant("e")).with_source("provider"),
                Element::new_message(assistant("f")).with_source("provider"),
            ])
            .await
            .unwrap();
        assert_eq!(*summarizer.calls.lock(), 2);
    }
}
