//! Configuration Traits Module
//!
//! Standardised interface for a stage to extract and validate its own
//! strongly-typed configuration out of the generic
//! [`crate::config::types::StageSpec`].
//!
//! ```rust
//! use confluent_stages::config::{StageParams, StageSpec, extract_param};
//!
//! #[derive(Debug)]
//! struct MinSpeechDurationParams { min_ms: u64 }
//!
//! impl StageParams for MinSpeechDurationParams {
//!     fn from_spec(spec: &StageSpec) -> anyhow::Result<Self> {
//!         Ok(Self { min_ms: extract_param(&spec.parameters, "min_speech_ms", 200) })
//!     }
//! }
//! ```

use crate::config::types::StageSpec;

pub trait StageParams: Sized {
    /// Extract and validate this stage's own configuration from the generic
    /// parameter bag. Implementations should call [`Self::validate`] at the
    /// end.
    fn from_spec(spec: &StageSpec) -> anyhow::Result<Self>;

    /// Internal-consistency check over already-extracted fields (value
    /// ranges, mutually exclusive options). Default accepts anything.
    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
