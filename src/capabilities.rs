//! Declarative I/O typing for stages, consulted only at build time.
//!
//! A stage with no declared capabilities accepts anything; a capability
//! mismatch between a producer and its declared consumer is a build-time
//! warning (logged), never a runtime failure — the runtime contract does
//! not otherwise know or care what a stage is "supposed" to accept.

use crate::element::{Content, Element};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Any,
    Text,
    Audio,
    Image,
    Video,
    Message,
    ToolCall,
}

#[derive(Debug, Clone, Default)]
pub struct AudioCapability {
    pub formats: Vec<String>,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub content_types: Vec<ContentType>,
    pub audio: Option<AudioCapability>,
}

impl Capabilities {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn of(types: impl IntoIterator<Item = ContentType>) -> Self {
        Self {
            content_types: types.into_iter().collect(),
            audio: None,
        }
    }

    /// An empty declaration means "accepts anything".
    pub fn accepts_content_type(&self, t: ContentType) -> bool {
        self.content_types.is_empty()
            || self.content_types.contains(&ContentType::Any)
            || self.content_types.contains(&t)
    }

    pub fn accepts_element(&self, element: &Element) -> bool {
        let Some(content) = element.content() else {
            return true; // control elements always pass capability checks
        };

        match content {
            Content::Text(_) => self.accepts_content_type(ContentType::Text),
            Content::Message(_) => self.accepts_content_type(ContentType::Message),
            Content::ToolCall(_) => self.accepts_content_type(ContentType::ToolCall),
            Content::Image(_) => self.accepts_content_type(ContentType::Image),
            Content::Video(_) => self.accepts_content_type(ContentType::Video),
            Content::Audio(audio) => {
                if !self.accepts_content_type(ContentType::Audio) {
                    return false;
                }
                match &self.audio {
                    None => true,
                    Some(cap) => {
                        (cap.formats.is_empty() || cap.formats.contains(&audio.encoding))
                            && (cap.sample_rates.is_empty()
                                || cap.sample_rates.contains(&audio.sample_rate))
                            && (cap.channels.is_empty() || cap.channels.contains(&audio.channels))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Element;

    #[test]
    fn empty_capabilities_accept_anything() {
        let caps = Capabilities::any();
        assert!(caps.accepts_element(&Element::new_text("x")));
    }

    #[test]
    fn restricted_capabilities_reject_mismatch() {
        let caps = Capabilities::of([ContentType::Audio]);
        assert!(!caps.accepts_element(&Element::new_text("x")));
    }

    #[test]
    fn control_elements_always_pass() {
        let caps = Capabilities::of([ContentType::Audio]);
        assert!(caps.accepts_element(&Element::new_error("boom")));
    }
}
