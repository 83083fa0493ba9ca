//! The envelope every stage reads and writes: [`Element`].
//!
//! An element is either content (exactly one of the variants in [`Content`])
//! or control (`Error` / end-of-stream). It is never both, and the empty
//! element (no content, no control) is a valid, explicit state used by a
//! handful of stages to mean "nothing to say about this one, but here it
//! is" (see `is_empty`).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordering / scheduling priority. Only consulted by the priority-transport
/// edges (`crate::priority_channel`); plain edges ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Index into a strict-priority multi-queue, highest priority first.
    pub fn queue_index(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

/// A conversational turn, the structured payload the legacy adapter and the
/// conversation sink both speak.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    pub parts: Vec<MessagePart>,
    pub tool_calls: Vec<ToolCall>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessagePart {
    Text(String),
    Image(ImageData),
    Video(VideoData),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    pub result: Option<Value>,
}

/// Audio samples plus the format information needed to interpret them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioData {
    pub samples: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: String,
}

/// Either the raw bytes of a still image, or a reference resolved lazily
/// through a `Storage` collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageData {
    pub bytes: Option<Vec<u8>>,
    pub storage_ref: Option<String>,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoData {
    pub bytes: Option<Vec<u8>>,
    pub storage_ref: Option<String>,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub framerate: f32,
    pub duration_ms: u64,
    pub is_keyframe: bool,
}

/// The one-of content slot. `enum` gives us the sum type directly; no
/// discriminator field is needed the way a struct-of-optionals would.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Content {
    Text(String),
    Message(Message),
    Audio(AudioData),
    Image(ImageData),
    Video(VideoData),
    ToolCall(ToolCall),
}

/// Global monotone sequence generator, one per process. Stages that mint new
/// elements (as opposed to forwarding one) should draw from this so
/// `Element::sequence` orders causally even across stage boundaries.
static SEQUENCE: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_else(|e| {
            tracing::warn!("system clock error: {e}");
            0
        })
}

/// The envelope flowing over every edge of the graph.
#[derive(Debug, Clone)]
pub struct Element {
    content: Option<Content>,
    error: Option<String>,
    end_of_stream: bool,

    pub metadata: HashMap<String, Value>,
    pub sequence: u64,
    pub source: String,
    pub priority: Priority,
    pub timestamp: u64,
}

impl Element {
    fn bare() -> Self {
        Self {
            content: None,
            error: None,
            end_of_stream: false,
            metadata: HashMap::new(),
            sequence: next_sequence(),
            source: String::new(),
            priority: Priority::default(),
            timestamp: now_millis(),
        }
    }

    pub fn new_text(text: impl Into<String>) -> Self {
        Self {
            content: Some(Content::Text(text.into())),
            ..Self::bare()
        }
    }

    pub fn new_message(message: Message) -> Self {
        Self {
            content: Some(Content::Message(message)),
            ..Self::bare()
        }
    }

    pub fn new_audio(audio: AudioData) -> Self {
        Self {
            content: Some(Content::Audio(audio)),
            ..Self::bare()
        }
    }

    pub fn new_image(image: ImageData) -> Self {
        Self {
            content: Some(Content::Image(image)),
            ..Self::bare()
        }
    }

    pub fn new_video(video: VideoData) -> Self {
        Self {
            content: Some(Content::Video(video)),
            ..Self::bare()
        }
    }

    pub fn new_tool_call(call: ToolCall) -> Self {
        Self {
            content: Some(Content::ToolCall(call)),
            ..Self::bare()
        }
    }

    pub fn new_error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::bare()
        }
    }

    pub fn new_end_of_stream() -> Self {
        Self {
            end_of_stream: true,
            ..Self::bare()
        }
    }

    /// No content, not control: metadata-only elements (the legacy
    /// adapter's trailing trace/cost summary) use this rather than hanging
    /// their payload off a content variant that doesn't fit.
    pub fn new_empty() -> Self {
        Self::bare()
    }

    pub fn content(&self) -> Option<&Content> {
        self.content.as_ref()
    }

    pub fn into_content(self) -> Option<Content> {
        self.content
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    pub fn is_control(&self) -> bool {
        self.error.is_some() || self.end_of_stream
    }

    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none() && !self.is_control()
    }

    /// Shallow-copy enrichment: clone the element and attach a metadata key.
    /// Stages should build new elements this way rather than mutating one
    /// already handed downstream.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn get_metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Best-effort plain text extraction, used by stages (the TTS transform,
    /// the legacy adapter) that accept "anything text-shaped": a literal
    /// `Text`, then a `Message.content`, then the first text part.
    pub fn extract_text(&self) -> Option<String> {
        match self.content.as_ref()? {
            Content::Text(t) => Some(t.clone()),
            Content::Message(m) if !m.content.is_empty() => Some(m.content.clone()),
            Content::Message(m) => m.parts.iter().find_map(|p| match p {
                MessagePart::Text(t) => Some(t.clone()),
                _ => None,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_element_has_content_and_is_not_control() {
        let e = Element::new_text("hi");
        assert!(e.has_content());
        assert!(!e.is_control());
        assert!(!e.is_empty());
        assert_eq!(e.extract_text().as_deref(), Some("hi"));
    }

    #[test]
    fn error_element_is_control_and_empty_of_content() {
        let e = Element::new_error("boom");
        assert!(e.is_control());
        assert!(!e.has_content());
        assert_eq!(e.error(), Some("boom"));
    }

    #[test]
    fn end_of_stream_is_control() {
        let e = Element::new_end_of_stream();
        assert!(e.is_control());
        assert!(e.is_end_of_stream());
    }

    #[test]
    fn bare_element_is_empty() {
        let e = Element::new_end_of_stream();
        assert!(!e.is_empty()); // control, not empty
    }

    #[test]
    fn with_metadata_is_shallow_copy_style() {
        let a = Element::new_text("x");
        let b = a.clone().with_metadata("k", "v");
        assert!(a.get_metadata("k").is_none());
        assert_eq!(b.get_metadata_str("k"), Some("v"));
    }

    #[test]
    fn sequence_is_monotone() {
        let a = Element::new_text("a");
        let b = Element::new_text("b");
        assert!(b.sequence > a.sequence);
    }
}
