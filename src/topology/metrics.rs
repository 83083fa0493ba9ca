//! Per-stage latency/error counters, optionally mirrored into a
//! `prometheus::Registry`. Wraps a stage rather than instrumenting the
//! runtime directly, the same way [`crate::topology::tracing_wrapper`]
//! wraps a stage's `run` future in a span: composition over a cross-cutting
//! hook baked into `Pipeline::execute`.
//!
//! This is new engineering added on top of the grounding codebase, which
//! carries no `prometheus` dependency or counter/registry pattern of its
//! own to draw from; the shape here follows `prometheus`'s own idiomatic
//! `*Vec` + `Registry::register` usage.

use crate::core::context::RunContext;
use crate::element::Element;
use crate::stage::{Inbound, Outbound, Stage, StageKind};

use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus::{HistogramVec, IntCounterVec, Opts, Registry};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A point-in-time read of a [`StageMetrics`] counter set.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub forwarded: u64,
    pub errored: u64,
    pub avg_latency: Option<Duration>,
    pub last_activity_ms: Option<u64>,
}

/// In-process snapshot of a wrapped stage's activity, readable without
/// going through a `prometheus::Registry` scrape: receive/forward/error
/// counts, average receive-to-send latency, and the timestamp of the last
/// activity. `reset()` zeroes everything, for tests and for operators who
/// want a fresh window without restarting the stage.
#[derive(Default)]
pub struct StageMetrics {
    received: AtomicU64,
    forwarded: AtomicU64,
    errors: AtomicU64,
    latency_sum_nanos: AtomicU64,
    latency_samples: AtomicU64,
    last_activity_ms: AtomicU64,
    pending: Mutex<VecDeque<Instant>>,
}

impl StageMetrics {
    fn touch_activity(&self) {
        self.last_activity_ms
            .store(crate::core::time::now_millis(), Ordering::Relaxed);
    }

    /// Records an element entering the stage; starts its latency clock.
    fn record_in(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().push_back(Instant::now());
        self.touch_activity();
    }

    /// Records an element leaving the stage; closes the latency clock
    /// opened by the oldest still-pending `record_in` (FIFO pairing, the
    /// same best-effort correlation a fan-out/fan-in stage itself uses
    /// for anything it can't track more precisely).
    fn record_out(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        if let Some(started) = self.pending.lock().pop_front() {
            let nanos = started.elapsed().as_nanos().min(u64::MAX as u128) as u64;
            self.latency_sum_nanos.fetch_add(nanos, Ordering::Relaxed);
            self.latency_samples.fetch_add(1, Ordering::Relaxed);
        }
        self.touch_activity();
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn elements_processed(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn avg_latency(&self) -> Option<Duration> {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return None;
        }
        let mean = self.latency_sum_nanos.load(Ordering::Relaxed) / samples;
        Some(Duration::from_nanos(mean))
    }

    pub fn last_activity_ms(&self) -> Option<u64> {
        let at = self.last_activity_ms.load(Ordering::Relaxed);
        (at > 0).then_some(at)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            errored: self.errors.load(Ordering::Relaxed),
            avg_latency: self.avg_latency(),
            last_activity_ms: self.last_activity_ms(),
        }
    }

    /// Zeroes every counter and drops any in-flight latency samples.
    pub fn reset(&self) {
        self.received.store(0, Ordering::Relaxed);
        self.forwarded.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.latency_sum_nanos.store(0, Ordering::Relaxed);
        self.latency_samples.store(0, Ordering::Relaxed);
        self.last_activity_ms.store(0, Ordering::Relaxed);
        self.pending.lock().clear();
    }
}

/// Optional prometheus handles shared across every `MeteredStage` registered
/// against the same `Registry`, keyed by stage name at observation time.
pub struct PrometheusHandles {
    elements_total: IntCounterVec,
    errors_total: IntCounterVec,
    run_duration_seconds: HistogramVec,
}

impl PrometheusHandles {
    pub fn register(registry: &Registry) -> anyhow::Result<Self> {
        let elements_total = IntCounterVec::new(
            Opts::new("stage_elements_total", "elements forwarded by a stage"),
            &["stage"],
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new("stage_errors_total", "stage run() failures"),
            &["stage"],
        )?;
        let run_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "stage_run_duration_seconds",
                "wall time of a stage's run() call",
            ),
            &["stage"],
        )?;
        registry.register(Box::new(elements_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(run_duration_seconds.clone()))?;
        Ok(Self {
            elements_total,
            errors_total,
            run_duration_seconds,
        })
    }
}

/// Wraps an inner stage, counting every element that passes through its
/// input and output sides and timing the whole `run()` call.
pub struct MeteredStage {
    inner: std::sync::Arc<dyn Stage>,
    metrics: std::sync::Arc<StageMetrics>,
    prometheus: Option<std::sync::Arc<PrometheusHandles>>,
}

impl MeteredStage {
    pub fn new(inner: std::sync::Arc<dyn Stage>) -> Self {
        Self {
            inner,
            metrics: std::sync::Arc::new(StageMetrics::default()),
            prometheus: None,
        }
    }

    pub fn with_prometheus(mut self, handles: std::sync::Arc<PrometheusHandles>) -> Self {
        self.prometheus = Some(handles);
        self
    }

    pub fn metrics(&self) -> std::sync::Arc<StageMetrics> {
        self.metrics.clone()
    }
}

struct CountingInbound {
    inner: Inbound,
    metrics: std::sync::Arc<StageMetrics>,
}

#[async_trait]
impl crate::stage::InboundPort for CountingInbound {
    async fn recv(&mut self, ctx: &RunContext) -> Option<Element> {
        let element = self.inner.recv(ctx).await;
        if element.is_some() {
            self.metrics.record_in();
        }
        element
    }
}

struct CountingOutbound {
    inner: Outbound,
    metrics: std::sync::Arc<StageMetrics>,
}

#[async_trait]
impl crate::stage::OutboundPort for CountingOutbound {
    async fn send(&self, ctx: &RunContext, element: Element) -> anyhow::Result<()> {
        let result = self.inner.send(ctx, element).await;
        if result.is_ok() {
            self.metrics.record_out();
        }
        result
    }

    fn close(&self) {
        self.inner.close();
    }
}

#[async_trait]
impl Stage for MeteredStage {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> StageKind {
        self.inner.kind()
    }

    async fn run(&self, ctx: RunContext, input: Inbound, output: Outbound) -> anyhow::Result<()> {
        let counted_input: Inbound = Box::new(CountingInbound {
            inner: input,
            metrics: self.metrics.clone(),
        });
        let counted_output: Outbound = std::sync::Arc::new(CountingOutbound {
            inner: output,
            metrics: self.metrics.clone(),
        });

        let start = Instant::now();
        let result = self.inner.run(ctx, counted_input, counted_output).await;
        let elapsed = start.elapsed().as_secs_f64();

        if let Some(handles) = &self.prometheus {
            handles
                .run_duration_seconds
                .with_label_values(&[self.name()])
                .observe(elapsed);
            if result.is_err() {
                handles.errors_total.with_label_values(&[self.name()]).inc();
            }
            handles
                .elements_total
                .with_label_values(&[self.name()])
                .inc_by(self.metrics.elements_processed());
        }
        if result.is_err() {
            self.metrics.record_error();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::passthrough::Passthrough;
    use std::sync::Arc;

    #[tokio::test]
    async fn counts_elements_forwarded_by_inner_stage() {
        let inner: Arc<dyn Stage> = Arc::new(Passthrough::new("inner"));
        let metered = MeteredStage::new(inner);
        let handle = metered.metrics();

        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(metered))
            .build()
            .unwrap();

        let out = pipeline
            .execute_sync(vec![Element::new_text("a"), Element::new_text("b")])
            .await
            .unwrap();

        assert_eq!(out.len(), 2);
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.forwarded, 2);
        assert_eq!(snapshot.errored, 0);
        assert!(snapshot.avg_latency.is_some());
        assert!(snapshot.last_activity_ms.is_some());
    }

    #[tokio::test]
    async fn reset_zeroes_every_counter() {
        let inner: Arc<dyn Stage> = Arc::new(Passthrough::new("inner"));
        let metered = MeteredStage::new(inner);
        let handle = metered.metrics();

        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(metered))
            .build()
            .unwrap();
        pipeline.execute_sync(vec![Element::new_text("a")]).await.unwrap();
        assert_eq!(handle.snapshot().received, 1);

        handle.reset();
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.received, 0);
        assert_eq!(snapshot.forwarded, 0);
        assert!(snapshot.avg_latency.is_none());
        assert!(snapshot.last_activity_ms.is_none());
    }
}
