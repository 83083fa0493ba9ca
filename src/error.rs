//! Error taxonomy shared across the runtime.
//!
//! Build-time failures (`BuildError`) and runtime-structural failures
//! (`RuntimeError`) are closed enums: the set of sentinel kinds is fixed by
//! the contracts in [`crate::builder`] and [`crate::pipeline`]. `StageError`
//! is the wrapper a stage uses to report an internal or collaborator failure
//! with enough context for the runtime to decide whether it is fatal.

use thiserror::Error;

/// Failures that `Builder::build()` can return.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("graph has no stages")]
    NoStages,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("duplicate stage name: {0}")]
    DuplicateStageName(String),

    #[error("edge references unknown stage: {0}")]
    StageNotFound(String),

    #[error("graph contains a cycle through stage: {0}")]
    CyclicDependency(String),
}

/// Failures surfaced by the pipeline runtime itself, as opposed to a stage's
/// own business logic.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("pipeline run was cancelled")]
    Cancelled,

    #[error("execution timeout exceeded")]
    ExecutionTimeoutExceeded,

    #[error("graceful shutdown grace period expired")]
    GracefulShutdownExpired,

    #[error("stage '{stage}' failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A failure originating inside a stage's `run` loop, either from its own
/// logic or from a collaborator it depends on.
///
/// `fatal` decides the propagation path described in the runtime's error
/// handling design: a fatal `StageError` is returned from `run` and cancels
/// the rest of the pipeline, a non-fatal one is converted into an `Error`
/// element and forwarded downstream.
#[derive(Debug, Error)]
#[error("stage '{stage}': {source}")]
pub struct StageError {
    pub stage: String,
    pub fatal: bool,
    #[source]
    pub source: anyhow::Error,
}

impl StageError {
    pub fn recoverable(stage: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self {
            stage: stage.into(),
            fatal: false,
            source: source.into(),
        }
    }

    pub fn fatal(stage: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self {
            stage: stage.into(),
            fatal: true,
            source: source.into(),
        }
    }
}
