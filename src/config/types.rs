//! Configuration Type Definitions
//!
//! Core configuration structures deserialised from TOML and used to
//! construct a pipeline via [`crate::builder::Builder`]. `PipelineConfig`
//! governs runtime behaviour (buffering, timeouts, priority, metrics);
//! `PipelineDefinition` is the declarative graph shape the thin CLI loader
//! turns into builder calls.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Transport used for a graph edge.
#[derive(Clone, Debug, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    /// Bounded point-to-point channel with backpressure (default).
    #[default]
    Direct,

    /// Broadcast channel; a slow subscriber drops messages rather than
    /// backpressuring the publisher.
    Broadcast,

    /// Flume channel; bounded, backpressuring, sync/async bridging.
    Shared,
}

fn default_capacity() -> usize {
    16
}

fn default_true() -> bool {
    true
}

/// Runtime behaviour for a built pipeline. Every field is validated by
/// [`super::validation::validate_runtime_config`].
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bounded channel capacity used for every edge unless a stage overrides
    /// it via its own `StageSpec.channel`.
    pub channel_buffer_size: usize,

    /// Whether edges use the priority multi-queue transport (§4.6) instead
    /// of a plain bounded channel.
    pub priority_queue_enabled: bool,

    /// Upper bound on concurrently executing pipelines sharing this config;
    /// 0 means unlimited.
    pub max_concurrent_pipelines: usize,

    /// Zero disables the execution deadline.
    pub execution_timeout_ms: u64,

    /// Grace period `shutdown()` waits for in-flight stages before
    /// force-cancelling.
    pub graceful_shutdown_timeout_ms: u64,

    pub metrics_enabled: bool,
    pub tracing_enabled: bool,
    pub prometheus_enabled: bool,
    pub prometheus_addr: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: default_capacity(),
            priority_queue_enabled: false,
            max_concurrent_pipelines: 0,
            execution_timeout_ms: 0,
            graceful_shutdown_timeout_ms: 5_000,
            metrics_enabled: true,
            tracing_enabled: true,
            prometheus_enabled: false,
            prometheus_addr: None,
        }
    }
}

impl PipelineConfig {
    pub fn execution_timeout(&self) -> Option<Duration> {
        (self.execution_timeout_ms > 0).then(|| Duration::from_millis(self.execution_timeout_ms))
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }
}

/// A single declared stage in a TOML-loaded graph definition.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StageSpec {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub parameters: Option<HashMap<String, serde_json::Value>>,
}

/// Declarative graph shape: stage name -> spec, plus stage name -> downstream
/// stage names. The thin CLI loader turns this into `add_stage` + `connect`/
/// `branch` calls against a [`crate::builder::Builder`]; it carries no
/// runtime logic itself.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub stages: HashMap<String, StageSpec>,

    #[serde(default)]
    pub edges: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub runtime: PipelineConfig,
}
