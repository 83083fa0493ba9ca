//! Pipeline runtime: materializes a built graph into live channels and
//! tasks, and supervises them to completion.
//!
//! Materialization (§4.4): one transport per edge; a stage with more than
//! one outgoing edge gets a [`crate::stage::FanOutOutbound`] relay; a stage
//! with more than one incoming edge gets a merge relay that tags each
//! element with `merge_input_index`. The same two relays handle the
//! pipeline's own external input and output when there is more than one
//! entry or terminal stage.

use crate::config::types::{ChannelType, PipelineConfig};
use crate::core::channel::{Channel, PubSubChannel};
use crate::core::context::{CancellationToken, RunContext};
use crate::element::Element;
use crate::error::RuntimeError;
use crate::events::{EventEmitter, PipelineEvent};
use crate::priority_channel::priority_channel;
use crate::stage::{
    ChannelOutbound, FanOutOutbound, Inbound, Outbound, PriorityInbound, PriorityOutbound, Stage,
};
use crate::topology::merge::merge_inbound;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub struct Pipeline {
    stages: HashMap<String, Arc<dyn Stage>>,
    edges: HashMap<String, Vec<String>>,
    config: PipelineConfig,
    event_emitter: Option<Arc<dyn EventEmitter>>,
    shutdown_token: CancellationToken,
    shutting_down: AtomicBool,
    active_runs: tokio::sync::watch::Sender<usize>,
}

/// One end of a freshly materialized edge transport.
struct EdgeEnds {
    outbound: Outbound,
    inbound: Inbound,
}

fn new_edge(config: &PipelineConfig) -> EdgeEnds {
    if config.priority_queue_enabled {
        let (tx, rx) = priority_channel(config.channel_buffer_size);
        EdgeEnds {
            outbound: Arc::new(PriorityOutbound(tx)),
            inbound: Box::new(PriorityInbound(rx)),
        }
    } else {
        let channel: Arc<dyn PubSubChannel<Element>> =
            Arc::new(Channel::new(ChannelType::Direct, config.channel_buffer_size));
        let inbound: Inbound = Box::new(crate::stage::SubscriberInbound(channel.subscribe()));
        EdgeEnds {
            outbound: Arc::new(ChannelOutbound(channel)),
            inbound,
        }
    }
}

pub struct PipelineRun {
    pub ctx: RunContext,
    pub output: Inbound,
    handle: tokio::task::JoinHandle<Result<(), RuntimeError>>,
}

impl PipelineRun {
    /// Wait for every stage task to finish and return the first fatal
    /// error, if any.
    pub async fn join(self) -> anyhow::Result<()> {
        match self.handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(join_err) => Err(anyhow::anyhow!(
                "pipeline supervisor task panicked: {join_err}"
            )),
        }
    }
}

impl Pipeline {
    pub(crate) fn new(
        stages: HashMap<String, Arc<dyn Stage>>,
        edges: HashMap<String, Vec<String>>,
        config: PipelineConfig,
        event_emitter: Option<Arc<dyn EventEmitter>>,
    ) -> Self {
        Self {
            stages,
            edges,
            config,
            event_emitter,
            shutdown_token: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
            active_runs: tokio::sync::watch::channel(0usize).0,
        }
    }

    fn incoming_counts(&self) -> HashMap<&str, usize> {
        let mut counts: HashMap<&str, usize> =
            self.stages.keys().map(|k| (k.as_str(), 0)).collect();
        for targets in self.edges.values() {
            for target in targets {
                *counts.entry(target.as_str()).or_insert(0) += 1;
            }
        }
        counts
    }

    fn is_terminal(&self, name: &str) -> bool {
        !self.edges.contains_key(name) || self.edges[name].is_empty()
    }

    /// Materialize the graph and spawn one task per stage. Returns
    /// immediately with the caller-facing output port; a background
    /// supervisor drains stage tasks to completion and reports the first
    /// fatal error through [`PipelineRun::join`].
    pub fn execute(&self, input: Inbound) -> anyhow::Result<PipelineRun> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(anyhow::anyhow!(
                "pipeline is shutting down, rejecting new execution"
            ));
        }

        let run_token = self.shutdown_token.child();
        let base_ctx = RunContext::from_token(run_token);
        let ctx = match self.config.execution_timeout() {
            Some(timeout) => base_ctx.with_timeout(timeout),
            None => base_ctx,
        };

        let incoming = self.incoming_counts();

        // One edge channel per declared edge, keyed by (from, to).
        let mut edge_inbound: HashMap<(String, String), Inbound> = HashMap::new();
        let mut edge_outbound: HashMap<(String, String), Outbound> = HashMap::new();
        for (from, targets) in &self.edges {
            for to in targets {
                let ends = new_edge(&self.config);
                edge_outbound.insert((from.clone(), to.clone()), ends.outbound);
                edge_inbound.insert((from.clone(), to.clone()), ends.inbound);
            }
        }

        // Entry stages: not the target of any edge. Fan the external input
        // out to all of them (usually exactly one).
        let mut entry_names: Vec<&str> = self
            .stages
            .keys()
            .map(String::as_str)
            .filter(|name| incoming.get(name).copied().unwrap_or(0) == 0)
            .collect();
        entry_names.sort();

        let mut entry_inputs: HashMap<String, Inbound> = HashMap::new();
        if entry_names.len() <= 1 {
            if let Some(only) = entry_names.first() {
                entry_inputs.insert((*only).to_string(), input);
            }
        } else {
            let mut siblings: Vec<Outbound> = Vec::new();
            for name in &entry_names {
                let ends = new_edge(&self.config);
                entry_inputs.insert((*name).to_string(), ends.inbound);
                siblings.push(ends.outbound);
            }
            spawn_forwarder(ctx.clone(), input, Arc::new(FanOutOutbound(siblings)));
        }

        // Terminal stages: no outgoing edges. Their output feeds the
        // pipeline's external output, merged if there is more than one.
        let mut terminal_names: Vec<&str> = self
            .stages
            .keys()
            .map(String::as_str)
            .filter(|name| self.is_terminal(name))
            .collect();
        terminal_names.sort();

        let mut terminal_outputs: HashMap<String, Outbound> = HashMap::new();
        let mut terminal_inbounds: Vec<Inbound> = Vec::new();
        for name in &terminal_names {
            let ends = new_edge(&self.config);
            terminal_outputs.insert((*name).to_string(), ends.outbound);
            terminal_inbounds.push(ends.inbound);
        }

        let output = if terminal_inbounds.len() == 1 {
            terminal_inbounds.into_iter().next().unwrap()
        } else {
            merge_inbound(self.config.channel_buffer_size, ctx.clone(), terminal_inbounds)
        };

        // Wire each stage's inbound (direct, or merged if fan-in) and
        // outbound (direct, or fanned-out if fan-out), then spawn it.
        let mut join_handles = Vec::new();
        let emitter = self.event_emitter.clone();

        for (name, stage) in &self.stages {
            let stage_input: Inbound = if let Some(entry) = entry_inputs.remove(name.as_str()) {
                entry
            } else {
                let mut upstreams = Vec::new();
                for (from, targets) in &self.edges {
                    if targets.contains(name) {
                        if let Some(inbound) = edge_inbound.remove(&(from.clone(), name.clone())) {
                            upstreams.push(inbound);
                        }
                    }
                }
                if upstreams.len() == 1 {
                    upstreams.into_iter().next().unwrap()
                } else {
                    merge_inbound(self.config.channel_buffer_size, ctx.clone(), upstreams)
                }
            };

            let stage_output: Outbound = if stage.named_destinations() {
                // Bypasses the generic edge fan-out entirely: each outgoing
                // edge is handed to the stage individually, addressed by
                // its downstream name, instead of broadcast through one
                // merged port.
                terminal_outputs.remove(name.as_str());
                let targets = self.edges.get(name).cloned().unwrap_or_default();
                for to in &targets {
                    if let Some(outbound) = edge_outbound.remove(&(name.clone(), to.clone())) {
                        stage.register_destination(to, outbound);
                    }
                }
                Arc::new(crate::stage::NullOutbound)
            } else if let Some(terminal) = terminal_outputs.remove(name.as_str()) {
                terminal
            } else {
                let targets = self.edges.get(name).cloned().unwrap_or_default();
                let mut siblings = Vec::new();
                for to in &targets {
                    if let Some(outbound) = edge_outbound.remove(&(name.clone(), to.clone())) {
                        siblings.push(outbound);
                    }
                }
                if siblings.len() == 1 {
                    siblings.into_iter().next().unwrap()
                } else {
                    Arc::new(FanOutOutbound(siblings))
                }
            };

            let stage = stage.clone();
            let stage_name = name.clone();
            let stage_kind = stage.kind();
            let stage_ctx = ctx.clone();
            let emitter = emitter.clone();

            let handle = tokio::spawn(async move {
                if let Some(e) = &emitter {
                    e.emit(PipelineEvent::StageStarted {
                        name: stage_name.clone(),
                        kind: stage_kind,
                        at_millis: crate::core::time::now_millis(),
                    });
                }
                let start = Instant::now();
                let result = stage.run(stage_ctx, stage_input, stage_output).await;
                let duration = start.elapsed();
                match &result {
                    Ok(()) => {
                        if let Some(e) = &emitter {
                            e.emit(PipelineEvent::StageCompleted {
                                name: stage_name.clone(),
                                duration,
                            });
                        }
                    }
                    Err(err) => {
                        if let Some(e) = &emitter {
                            e.emit(PipelineEvent::StageFailed {
                                name: stage_name.clone(),
                                duration,
                                message: err.to_string(),
                            });
                        }
                    }
                }
                (stage_name, result)
            });
            join_handles.push(handle);
        }

        let supervisor_ctx = ctx.clone();
        let active_runs = self.active_runs.clone();
        active_runs.send_modify(|n| *n += 1);
        let supervisor = tokio::spawn(async move {
            let mut first_error: Option<RuntimeError> = None;
            for handle in join_handles {
                match handle.await {
                    Ok((stage_name, Ok(()))) => {
                        tracing::debug!(stage = %stage_name, "stage task returned cleanly");
                    }
                    Ok((stage_name, Err(err))) => {
                        tracing::error!(stage = %stage_name, error = %err, "stage task failed");
                        if first_error.is_none() {
                            supervisor_ctx.cancel();
                            first_error = Some(RuntimeError::StageFailed {
                                stage: stage_name,
                                source: err,
                            });
                        }
                    }
                    Err(join_err) => {
                        tracing::error!(error = %join_err, "stage task panicked");
                    }
                }
            }
            active_runs.send_modify(|n| *n -= 1);
            match first_error {
                Some(err) => Err(err),
                None if supervisor_ctx.is_cancelled() => Err(RuntimeError::Cancelled),
                None => Ok(()),
            }
        });

        Ok(PipelineRun {
            ctx,
            output,
            handle: supervisor,
        })
    }

    /// Push `elements` through the pipeline, close the input, and collect
    /// every output element into a `Vec`. Blocks until the run is terminal.
    pub async fn execute_sync(&self, elements: Vec<Element>) -> anyhow::Result<Vec<Element>> {
        let capacity = self.config.channel_buffer_size.max(elements.len()).max(1);
        let channel: Arc<dyn PubSubChannel<Element>> =
            Arc::new(Channel::new(ChannelType::Direct, capacity));
        let input_outbound = ChannelOutbound(channel.clone());
        let input_inbound: Inbound = Box::new(crate::stage::SubscriberInbound(channel.subscribe()));

        let run = self.execute(input_inbound)?;

        for element in elements {
            input_outbound
                .0
                .publish(element)
                .await
                .map_err(|_| anyhow::anyhow!("pipeline input channel closed unexpectedly"))?;
        }
        input_outbound.0.close();

        let ctx = run.ctx.clone();
        let mut output = run.output;
        let mut collected = Vec::new();
        while let Some(element) = output.recv(&ctx).await {
            collected.push(element);
        }

        run.join().await?;
        Ok(collected)
    }

    /// Waits up to the configured grace period for every in-flight run's
    /// stage tasks to return on their own. Only if the grace period expires
    /// first does this cancel `runCtx`, forcing the remaining stages to
    /// unwind; an already-quiescent pipeline returns immediately without
    /// ever touching the cancellation token. Idempotent: a second call is a
    /// no-op.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let grace_period = self.config.graceful_shutdown_timeout();
        tracing::info!(?grace_period, "pipeline shutdown initiated");

        let mut active_runs = self.active_runs.subscribe();
        if *active_runs.borrow() == 0 {
            tracing::info!("pipeline already quiescent, nothing to wait for");
            return Ok(());
        }

        let quiesced = active_runs.wait_for(|n| *n == 0);
        match tokio::time::timeout(grace_period, quiesced).await {
            Ok(_) => {
                tracing::info!("in-flight stages returned within the grace period");
                Ok(())
            }
            Err(_) => {
                tracing::warn!("graceful shutdown grace period expired, cancelling in-flight stages");
                self.shutdown_token.cancel();
                Err(RuntimeError::GracefulShutdownExpired)
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

fn spawn_forwarder(ctx: RunContext, mut input: Inbound, output: Outbound) {
    tokio::spawn(async move {
        while let Some(element) = input.recv(&ctx).await {
            if output.send(&ctx, element).await.is_err() {
                break;
            }
        }
        output.close();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageKind;
    use async_trait::async_trait;

    struct Uppercase;

    #[async_trait]
    impl Stage for Uppercase {
        fn name(&self) -> &str {
            "upper"
        }
        fn kind(&self) -> StageKind {
            StageKind::Transform
        }
        async fn run(&self, ctx: RunContext, mut input: Inbound, output: Outbound) -> anyhow::Result<()> {
            while let Some(element) = input.recv(&ctx).await {
                let text = element.extract_text().unwrap_or_default().to_uppercase();
                if output.send(&ctx, Element::new_text(text)).await.is_err() {
                    break;
                }
            }
            output.close();
            Ok(())
        }
    }

    struct Passthrough(&'static str);

    #[async_trait]
    impl Stage for Passthrough {
        fn name(&self) -> &str {
            self.0
        }
        fn kind(&self) -> StageKind {
            StageKind::Transform
        }
        async fn run(&self, ctx: RunContext, mut input: Inbound, output: Outbound) -> anyhow::Result<()> {
            while let Some(element) = input.recv(&ctx).await {
                if output.send(&ctx, element).await.is_err() {
                    break;
                }
            }
            output.close();
            Ok(())
        }
    }

    #[tokio::test]
    async fn linear_chain_uppercases() {
        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(Passthrough("src")))
            .add_stage(Arc::new(Uppercase))
            .add_stage(Arc::new(Passthrough("sink")))
            .connect("src", "upper")
            .connect("upper", "sink")
            .build()
            .unwrap();

        let out = pipeline
            .execute_sync(vec![Element::new_text("Hello")])
            .await
            .unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].extract_text().as_deref(), Some("HELLO"));
    }

    #[tokio::test]
    async fn fan_out_reaches_every_branch() {
        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(Passthrough("src")))
            .add_stage(Arc::new(Passthrough("b")))
            .add_stage(Arc::new(Passthrough("c")))
            .connect("src", "b")
            .connect("src", "c")
            .build()
            .unwrap();

        let out = pipeline
            .execute_sync(vec![Element::new_text("x"), Element::new_text("y")])
            .await
            .unwrap();

        // Two branches, two elements each: four elements land in the merged
        // output, tagged with which branch they came through.
        assert_eq!(out.len(), 4);
        let indices: std::collections::HashSet<_> = out
            .iter()
            .filter_map(|e| e.get_metadata("merge_input_index").and_then(|v| v.as_u64()))
            .collect();
        assert_eq!(indices.len(), 2);
    }

    #[tokio::test]
    async fn fan_in_tags_each_source() {
        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(Passthrough("a")))
            .add_stage(Arc::new(Passthrough("b")))
            .add_stage(Arc::new(Passthrough("sink")))
            .connect("a", "sink")
            .connect("b", "sink")
            .build()
            .unwrap();

        // execute_sync only drives one entry point; here both "a" and "b"
        // are entry stages, so drive the merged external input directly.
        let channel: Arc<dyn PubSubChannel<Element>> =
            Arc::new(Channel::new(ChannelType::Direct, 8));
        let input: Inbound = Box::new(crate::stage::SubscriberInbound(channel.subscribe()));
        let run = pipeline.execute(input).unwrap();
        channel.publish(Element::new_text("only")).await.unwrap();
        channel.close();

        let ctx = run.ctx.clone();
        let mut output = run.output;
        let mut collected = Vec::new();
        while let Some(element) = output.recv(&ctx).await {
            collected.push(element);
        }
        run.join().await.unwrap();

        assert_eq!(collected.len(), 2);
        let indices: std::collections::HashSet<_> = collected
            .iter()
            .filter_map(|e| e.get_metadata("merge_input_index").and_then(|v| v.as_u64()))
            .collect();
        assert_eq!(indices, std::collections::HashSet::from([0, 1]));
    }

    struct Blocking;

    #[async_trait]
    impl Stage for Blocking {
        fn name(&self) -> &str {
            "blocking"
        }
        fn kind(&self) -> StageKind {
            StageKind::Transform
        }
        async fn run(&self, ctx: RunContext, mut input: Inbound, output: Outbound) -> anyhow::Result<()> {
            while let Some(element) = input.recv(&ctx).await {
                if output.send(&ctx, element).await.is_err() {
                    break;
                }
            }
            ctx.cancelled().await;
            output.close();
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_on_a_quiescent_pipeline_returns_immediately() {
        let pipeline = crate::builder::Builder::new()
            .add_stage(Arc::new(Passthrough("src")))
            .build()
            .unwrap();

        pipeline.shutdown().await.unwrap();
        assert!(pipeline.is_shutting_down());
    }

    #[tokio::test]
    async fn shutdown_expires_and_cancels_a_stage_stuck_past_its_grace_period() {
        let mut config = PipelineConfig::default();
        config.graceful_shutdown_timeout_ms = 20;

        let pipeline = crate::builder::Builder::new()
            .with_config(config)
            .add_stage(Arc::new(Blocking))
            .build()
            .unwrap();

        let channel: Arc<dyn PubSubChannel<Element>> =
            Arc::new(Channel::new(ChannelType::Direct, 8));
        let input: Inbound = Box::new(crate::stage::SubscriberInbound(channel.subscribe()));
        let run = pipeline.execute(input).unwrap();
        channel.publish(Element::new_text("x")).await.unwrap();

        let ctx = run.ctx.clone();
        let mut output = run.output;
        let _ = output.recv(&ctx).await;

        let result = pipeline.shutdown().await;
        assert!(matches!(result, Err(RuntimeError::GracefulShutdownExpired)));

        channel.close();
        run.join().await.unwrap();
    }
}
