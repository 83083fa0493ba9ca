//! Transport primitives backing a graph edge.
//!
//! Every edge in a built pipeline is one of these channel kinds, chosen by
//! [`crate::config::types::ChannelType`] and wrapping either a bounded mpsc
//! channel (the default, used for plain 1:1 edges), a broadcast channel, or
//! a flume channel for stages more comfortable with a sync-friendly API.
//! `Subscriber` erases the differences behind a single `recv`/`try_recv`
//! surface so stage code never needs to match on transport.

use crate::config::types::ChannelType;

use async_trait::async_trait;
use flume;
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug)]
pub enum PublishError<M> {
    BroadcastError(broadcast::error::SendError<M>),
    MpscError(mpsc::error::SendError<M>),
    FlumeError(flume::SendError<M>),
    FanoutError(mpsc::error::SendError<M>),
}

pub enum Subscriber<M> {
    Broadcast(broadcast::Receiver<M>),
    Mpsc(mpsc::Receiver<M>),
    Flume(flume::Receiver<M>),
    Fanout(mpsc::Receiver<M>),
}

impl<M> Subscriber<M>
where
    M: Clone,
{
    /// Receive the next element from the channel.
    /// - mpsc: returns `None` if the channel is closed.
    /// - broadcast: skips lagged, returns `None` if the channel is closed.
    /// - flume: returns `None` if disconnected.
    /// - fanout: returns `None` if the channel is closed.
    pub async fn recv(&mut self) -> Option<M> {
        match self {
            Subscriber::Mpsc(rx) => rx.recv().await,
            Subscriber::Broadcast(rx) => match rx.recv().await {
                Ok(msg) => Some(msg),
                Err(broadcast::error::RecvError::Lagged(_)) => None,
                Err(broadcast::error::RecvError::Closed) => None,
            },
            Subscriber::Flume(rx) => match rx.recv_async().await {
                Ok(msg) => Some(msg),
                Err(flume::RecvError::Disconnected) => None,
            },
            Subscriber::Fanout(rx) => rx.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Option<M> {
        match self {
            Subscriber::Mpsc(rx) => rx.try_recv().ok(),
            Subscriber::Broadcast(rx) => rx.try_recv().ok(),
            Subscriber::Flume(rx) => rx.try_recv().ok(),
            Subscriber::Fanout(rx) => rx.try_recv().ok(),
        }
    }
}

#[async_trait]
pub trait PubSubChannel<M>: Send + Sync {
    async fn publish(&self, msg: M) -> Result<(), PublishError<M>>;

    fn subscribe(&self) -> Subscriber<M>;

    fn close(&self);
}

/// MPSC / point-to-point channel: the default transport for a plain 1:1 edge.
pub struct MpscChannel<M> {
    sender: Mutex<Option<mpsc::Sender<M>>>,
    receiver: Mutex<Option<mpsc::Receiver<M>>>,
}

impl<M> MpscChannel<M> {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
        }
    }
}

#[async_trait]
impl<M> PubSubChannel<M> for MpscChannel<M>
where
    M: Send + 'static,
{
    async fn publish(&self, msg: M) -> Result<(), PublishError<M>> {
        let sender = {
            let guard = self.sender.lock().expect("mpsc sender mutex poisoned");
            guard.clone()
        };
        match sender {
            Some(sender) => sender.send(msg).await.map_err(PublishError::MpscError),
            None => Err(PublishError::MpscError(mpsc::error::SendError(msg))),
        }
    }

    fn subscribe(&self) -> Subscriber<M> {
        let mut guard = self.receiver.lock().expect("mpsc receiver mutex poisoned");
        Subscriber::Mpsc(
            guard
                .take()
                .expect("mpsc: subscribe() called more than once"),
        )
    }

    fn close(&self) {
        self.sender.lock().expect("mpsc sender mutex poisoned").take();
    }
}

/// Broadcast channel / fan-out channel.
pub struct BroadcastChannel<M> {
    sender: broadcast::Sender<M>,
}

impl<M> BroadcastChannel<M>
where
    M: Clone + Send + Sync + 'static,
{
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

#[async_trait]
impl<M> PubSubChannel<M> for BroadcastChannel<M>
where
    M: Clone + Send + Sync + 'static,
{
    async fn publish(&self, msg: M) -> Result<(), PublishError<M>> {
        self.sender
            .send(msg)
            .map(|_| ())
            .map_err(PublishError::BroadcastError)
    }

    fn subscribe(&self) -> Subscriber<M> {
        Subscriber::Broadcast(self.sender.subscribe())
    }

    fn close(&self) {
        // Broadcast channels close naturally once the last sender drops;
        // there is nothing this wrapper owns exclusively to drop early.
    }
}

/// Flume channel: async/sync-bridging transport, used by stages that need
/// `try_recv`-heavy polling loops (e.g. the priority sweep in accumulators).
pub struct FlumeChannel<M> {
    sender: Mutex<Option<flume::Sender<M>>>,
    receiver: flume::Receiver<M>,
}

impl<M> FlumeChannel<M> {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = flume::bounded(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }
}

#[async_trait]
impl<M> PubSubChannel<M> for FlumeChannel<M>
where
    M: Send + 'static,
{
    async fn publish(&self, msg: M) -> Result<(), PublishError<M>> {
        let sender = {
            let guard = self.sender.lock().expect("flume sender mutex poisoned");
            guard.clone()
        };
        match sender {
            Some(sender) => sender
                .send_async(msg)
                .await
                .map_err(PublishError::FlumeError),
            None => Err(PublishError::FlumeError(flume::SendError(msg))),
        }
    }

    fn subscribe(&self) -> Subscriber<M> {
        Subscriber::Flume(self.receiver.clone())
    }

    fn close(&self) {
        self.sender.lock().expect("flume sender mutex poisoned").take();
    }
}

/// Enum wrapper dispatching to the concrete transport chosen by config.
pub enum Channel<M> {
    Broadcast(BroadcastChannel<M>),
    Mpsc(MpscChannel<M>),
    Flume(FlumeChannel<M>),
}

impl<M> Channel<M>
where
    M: Clone + Send + Sync + 'static,
{
    pub fn new(kind: ChannelType, capacity: usize) -> Self {
        match kind {
            ChannelType::Broadcast => Channel::Broadcast(BroadcastChannel::new(capacity)),
            ChannelType::Direct => Channel::Mpsc(MpscChannel::new(capacity)),
            ChannelType::Shared => Channel::Flume(FlumeChannel::new(capacity)),
        }
    }
}

#[async_trait]
impl<M> PubSubChannel<M> for Channel<M>
where
    M: Clone + Send + Sync + 'static,
{
    async fn publish(&self, msg: M) -> Result<(), PublishError<M>> {
        match self {
            Channel::Broadcast(bc) => bc.publish(msg).await,
            Channel::Mpsc(mc) => mc.publish(msg).await,
            Channel::Flume(fc) => fc.publish(msg).await,
        }
    }

    fn subscribe(&self) -> Subscriber<M> {
        match self {
            Channel::Broadcast(bc) => bc.subscribe(),
            Channel::Mpsc(mc) => mc.subscribe(),
            Channel::Flume(fc) => fc.subscribe(),
        }
    }

    fn close(&self) {
        match self {
            Channel::Broadcast(bc) => bc.close(),
            Channel::Mpsc(mc) => mc.close(),
            Channel::Flume(fc) => fc.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mpsc_roundtrip() {
        let ch: MpscChannel<i32> = MpscChannel::new(4);
        let mut sub = ch.subscribe();
        ch.publish(42).await.unwrap();
        assert_eq!(sub.recv().await, Some(42));
    }

    #[tokio::test]
    async fn mpsc_close_ends_subscriber() {
        let ch: MpscChannel<i32> = MpscChannel::new(4);
        let mut sub = ch.subscribe();
        ch.close();
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let ch: BroadcastChannel<i32> = BroadcastChannel::new(4);
        let mut a = ch.subscribe();
        let mut b = ch.subscribe();
        ch.publish(7).await.unwrap();
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }
}
