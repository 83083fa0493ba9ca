//! Shared coordination state between the audio-turn accumulator and the TTS
//! transform. Both hold the same `Arc<InterruptionState>`; neither reaches
//! into the other's fields directly, the same division of responsibility
//! [`crate::core::context::CancellationToken`] draws between the flag and
//! whoever observes it.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct InterruptionState {
    bot_speaking: AtomicBool,
    was_interrupted: AtomicBool,
}

impl InterruptionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bot_speaking(&self, speaking: bool) {
        self.bot_speaking.store(speaking, Ordering::SeqCst);
    }

    pub fn is_bot_speaking(&self) -> bool {
        self.bot_speaking.load(Ordering::SeqCst)
    }

    /// Records that an interruption happened (e.g. the user started
    /// speaking again while the bot was talking).
    pub fn interrupt(&self) {
        self.was_interrupted.store(true, Ordering::SeqCst);
    }

    /// Reads and clears the interruption flag in one step, so a single
    /// check both observes and consumes it.
    pub fn take_interrupted(&self) -> bool {
        self.was_interrupted.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_interrupted_clears_the_flag() {
        let state = InterruptionState::new();
        assert!(!state.take_interrupted());
        state.interrupt();
        assert!(state.take_interrupted());
        assert!(!state.take_interrupted());
    }
}
