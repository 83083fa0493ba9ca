//! Wraps a stage with per-element trace propagation: assigns a `trace-id`
//! if an element doesn't already carry one, and records this stage's
//! enter/exit timestamps into a per-element stage-times map under a
//! reserved metadata key. [`get_trace_info`] reads both back. The whole
//! `run()` future is also wrapped in a `tracing` span so every log line the
//! inner stage emits carries its name and kind.

use crate::core::context::RunContext;
use crate::element::Element;
use crate::stage::{Inbound, InboundPort, Outbound, OutboundPort, Stage, StageKind};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::Instrument;

const TRACE_ID_KEY: &str = "trace_id";
const STAGE_TIMES_KEY: &str = "stage_times";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTiming {
    pub enter_ms: Option<u64>,
    pub exit_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TraceInfo {
    pub trace_id: String,
    pub stage_times: HashMap<String, StageTiming>,
}

/// Reads back what [`TracedStage`] has recorded on an element so far.
pub fn get_trace_info(element: &Element) -> Option<TraceInfo> {
    let trace_id = element.get_metadata(TRACE_ID_KEY)?.as_str()?.to_string();
    let stage_times = element
        .get_metadata(STAGE_TIMES_KEY)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    Some(TraceInfo { trace_id, stage_times })
}

fn ensure_trace_id(element: Element) -> Element {
    if element.get_metadata(TRACE_ID_KEY).is_some() {
        element
    } else {
        element.with_metadata(TRACE_ID_KEY, uuid::Uuid::new_v4().to_string())
    }
}

fn stamp(element: Element, stage_name: &str, mark: impl FnOnce(&mut StageTiming)) -> Element {
    let element = ensure_trace_id(element);
    let mut times: HashMap<String, StageTiming> = element
        .get_metadata(STAGE_TIMES_KEY)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    let entry = times.entry(stage_name.to_string()).or_default();
    mark(entry);
    let value = serde_json::to_value(&times).unwrap_or(serde_json::Value::Null);
    element.with_metadata(STAGE_TIMES_KEY, value)
}

struct TracingInbound {
    inner: Inbound,
    stage_name: String,
}

#[async_trait]
impl InboundPort for TracingInbound {
    async fn recv(&mut self, ctx: &RunContext) -> Option<Element> {
        let element = self.inner.recv(ctx).await?;
        let now = crate::core::time::now_millis();
        Some(stamp(element, &self.stage_name, |t| t.enter_ms = Some(now)))
    }
}

struct TracingOutbound {
    inner: Outbound,
    stage_name: String,
}

#[async_trait]
impl OutboundPort for TracingOutbound {
    async fn send(&self, ctx: &RunContext, element: Element) -> anyhow::Result<()> {
        let now = crate::core::time::now_millis();
        let element = stamp(element, &self.stage_name, |t| t.exit_ms = Some(now));
        self.inner.send(ctx, element).await
    }

    fn close(&self) {
        self.inner.close();
    }
}

pub struct TracedStage {
    inner: Arc<dyn Stage>,
}

impl TracedStage {
    pub fn new(inner: Arc<dyn Stage>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Stage for TracedStage {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> StageKind {
        self.inner.kind()
    }

    async fn run(&self, ctx: RunContext, input: Inbound, output: Outbound) -> anyhow::Result<()> {
        let span = tracing::info_span!("stage", name = %self.inner.name(), kind = ?self.inner.kind());
        let name = self.inner.name().to_string();
        let input: Inbound = Box::new(TracingInbound { inner: input, stage_name: name.clone() });
        let output: Outbound = Arc::new(TracingOutbound { inner: output, stage_name: name });
        self.inner.run(ctx, input, output).instrument(span).await
    }
}
