//! The uniform contract every processing unit in the graph satisfies.
//!
//! A stage never sees a concrete channel type: `Inbound`/`Outbound` are
//! trait objects so the same stage code runs unchanged whether the runtime
//! wired its edges with the plain mpsc/broadcast/flume transport
//! ([`crate::core::channel`]) or the priority multi-queue
//! ([`crate::priority_channel`]).

use crate::core::context::RunContext;
use crate::element::Element;

use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Transform,
    Accumulate,
    Generate,
    Sink,
    Bidirectional,
}

/// A stage's read end. `recv` returns `None` once the upstream is closed or
/// the context is cancelled.
#[async_trait]
pub trait InboundPort: Send {
    async fn recv(&mut self, ctx: &RunContext) -> Option<Element>;
}

/// A stage's write end. A stage must call `close` exactly once, on every
/// exit path.
#[async_trait]
pub trait OutboundPort: Send + Sync {
    async fn send(&self, ctx: &RunContext, element: Element) -> anyhow::Result<()>;

    fn close(&self);
}

pub type Inbound = Box<dyn InboundPort>;
pub type Outbound = Arc<dyn OutboundPort>;

/// Every stage in the graph implements this. The runtime owns `input`/
/// `output`; a stage must close `output` exactly once and must never close
/// `input`.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> StageKind;

    /// Stages that bypass the generic graph-edge fan-out (only
    /// [`crate::topology::router::Router`], so far) override this to `true`
    /// so the pipeline runtime hands them their outgoing edges one at a
    /// time via `register_destination` instead of folding them into a
    /// single [`FanOutOutbound`].
    fn named_destinations(&self) -> bool {
        false
    }

    /// Registers the port for out-edge `name`. No-op unless
    /// `named_destinations()` returns `true`.
    fn register_destination(&self, _name: &str, _outbound: Outbound) {}

    async fn run(&self, ctx: RunContext, input: Inbound, output: Outbound) -> anyhow::Result<()>;
}

/// Adapts a [`crate::core::channel::Subscriber`] to [`InboundPort`].
pub struct SubscriberInbound(pub crate::core::channel::Subscriber<Element>);

#[async_trait]
impl InboundPort for SubscriberInbound {
    async fn recv(&mut self, ctx: &RunContext) -> Option<Element> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => None,
            element = self.0.recv() => element,
        }
    }
}

/// Adapts a [`crate::core::channel::PubSubChannel`] to [`OutboundPort`].
pub struct ChannelOutbound(pub Arc<dyn crate::core::channel::PubSubChannel<Element>>);

#[async_trait]
impl OutboundPort for ChannelOutbound {
    async fn send(&self, ctx: &RunContext, element: Element) -> anyhow::Result<()> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(anyhow::anyhow!(crate::error::RuntimeError::Cancelled)),
            result = self.0.publish(element) => result.map_err(|_| anyhow::anyhow!("output channel closed")),
        }
    }

    fn close(&self) {
        self.0.close();
    }
}

/// Adapts a [`crate::priority_channel::PriorityReceiver`] to [`InboundPort`].
pub struct PriorityInbound(pub crate::priority_channel::PriorityReceiver);

#[async_trait]
impl InboundPort for PriorityInbound {
    async fn recv(&mut self, ctx: &RunContext) -> Option<Element> {
        self.0.recv(ctx).await
    }
}

/// Adapts a [`crate::priority_channel::PrioritySender`] to [`OutboundPort`].
pub struct PriorityOutbound(pub crate::priority_channel::PrioritySender);

#[async_trait]
impl OutboundPort for PriorityOutbound {
    async fn send(&self, ctx: &RunContext, element: Element) -> anyhow::Result<()> {
        self.0.send(ctx, element).await
    }

    fn close(&self) {
        self.0.close();
    }
}

/// A discard port handed to stages that use `named_destinations()` instead
/// of the generic `output` argument — they still owe it exactly one
/// `close()` call per the `Stage::run` contract, but never `send` through it.
pub struct NullOutbound;

#[async_trait]
impl OutboundPort for NullOutbound {
    async fn send(&self, _ctx: &RunContext, _element: Element) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&self) {}
}

/// An outbound port that fans out to several siblings, used by the runtime
/// whenever a stage has more than one outgoing edge. Policy is "complete
/// broadcast": every send goes to every sibling, so a slow sibling
/// backpressures all the others.
pub struct FanOutOutbound(pub Vec<Outbound>);

#[async_trait]
impl OutboundPort for FanOutOutbound {
    async fn send(&self, ctx: &RunContext, element: Element) -> anyhow::Result<()> {
        for sibling in &self.0 {
            sibling.send(ctx, element.clone()).await?;
        }
        Ok(())
    }

    fn close(&self) {
        for sibling in &self.0 {
            sibling.close();
        }
    }
}
