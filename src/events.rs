//! Best-effort pipeline lifecycle events.
//!
//! Emission never blocks the runtime and never fails the pipeline: a
//! missing or slow emitter simply means no one was watching.

use crate::stage::StageKind;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StageStarted {
        name: String,
        kind: StageKind,
        at_millis: u64,
    },
    StageCompleted {
        name: String,
        duration: Duration,
    },
    StageFailed {
        name: String,
        duration: Duration,
        message: String,
    },
}

pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Collects events in memory; used by tests and by the CLI's `--verbose`
/// mode, which drains and prints it after a run.
#[derive(Default)]
pub struct RecordingEmitter {
    events: parking_lot::Mutex<Vec<PipelineEvent>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<PipelineEvent> {
        std::mem::take(&mut self.events.lock())
    }
}

impl EventEmitter for RecordingEmitter {
    fn emit(&self, event: PipelineEvent) {
        self.events.lock().push(event);
    }
}

/// Logs every event through `tracing` at a level matching its severity.
pub struct TracingEmitter;

impl EventEmitter for TracingEmitter {
    fn emit(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::StageStarted { name, kind, .. } => {
                tracing::info!(stage = %name, ?kind, "stage started");
            }
            PipelineEvent::StageCompleted { name, duration } => {
                tracing::info!(stage = %name, ?duration, "stage completed");
            }
            PipelineEvent::StageFailed {
                name,
                duration,
                message,
            } => {
                tracing::error!(stage = %name, ?duration, error = %message, "stage failed");
            }
        }
    }
}
