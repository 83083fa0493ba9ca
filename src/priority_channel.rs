//! Bounded multi-queue transport used in place of a plain channel when
//! `priority_queue_enabled` is set.
//!
//! Four sub-queues, one per [`Priority`] class, each a bounded `VecDeque`
//! guarded by a single `parking_lot::Mutex` plus a `tokio::sync::Notify` for
//! waking receivers. Dequeue always drains the highest non-empty class first
//! — strict priority, no aging, which is the right trade-off for interactive
//! modalities where a `Critical` barge-in must never wait behind a backlog
//! of `Low` telemetry.

use crate::core::context::RunContext;
use crate::element::{Element, Priority};

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

struct Queues {
    buffers: [Mutex<VecDeque<Element>>; 4],
    len: AtomicUsize,
    capacity: usize,
    closed: AtomicBool,
    not_empty: Notify,
    not_full: Notify,
}

/// Sender handle; cloneable, all clones share the same underlying queues.
#[derive(Clone)]
pub struct PrioritySender {
    queues: Arc<Queues>,
}

/// Receiver handle. Not cloneable — one logical consumer per channel,
/// matching the mpsc transport's semantics.
pub struct PriorityReceiver {
    queues: Arc<Queues>,
}

pub fn priority_channel(capacity: usize) -> (PrioritySender, PriorityReceiver) {
    let queues = Arc::new(Queues {
        buffers: Default::default(),
        len: AtomicUsize::new(0),
        capacity: capacity.max(1),
        closed: AtomicBool::new(false),
        not_empty: Notify::new(),
        not_full: Notify::new(),
    });
    (
        PrioritySender {
            queues: queues.clone(),
        },
        PriorityReceiver { queues },
    )
}

impl PrioritySender {
    /// Blocks while the queue is at capacity, selecting on cancellation.
    /// Returns `Err` if the channel was closed or the context was
    /// cancelled first.
    pub async fn send(&self, ctx: &RunContext, element: Element) -> anyhow::Result<()> {
        loop {
            if self.queues.closed.load(Ordering::Acquire) {
                return Err(anyhow::anyhow!("priority channel closed"));
            }
            if self.queues.len.load(Ordering::Acquire) < self.queues.capacity {
                let idx = element.priority.queue_index();
                self.queues.buffers[idx].lock().push_back(element);
                self.queues.len.fetch_add(1, Ordering::AcqRel);
                self.queues.not_empty.notify_waiters();
                return Ok(());
            }

            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(anyhow::anyhow!(crate::error::RuntimeError::Cancelled)),
                _ = self.queues.not_full.notified() => continue,
            }
        }
    }

    pub fn close(&self) {
        self.queues.closed.store(true, Ordering::Release);
        self.queues.not_empty.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.queues.len.load(Ordering::Acquire)
    }
}

impl PriorityReceiver {
    /// Returns the oldest element of the highest non-empty priority class,
    /// `None` once the channel is closed and fully drained.
    pub async fn recv(&mut self, ctx: &RunContext) -> Option<Element> {
        loop {
            if let Some(element) = self.try_recv() {
                return Some(element);
            }
            if self.queues.closed.load(Ordering::Acquire) && self.queues.len() == 0 {
                return None;
            }

            tokio::select! {
                biased;
                _ = ctx.cancelled() => return None,
                _ = self.queues.not_empty.notified() => continue,
            }
        }
    }

    fn try_recv(&self) -> Option<Element> {
        for class in Priority::ALL {
            let mut buf = self.queues.buffers[class.queue_index()].lock();
            if let Some(element) = buf.pop_front() {
                drop(buf);
                self.queues.len.fetch_sub(1, Ordering::AcqRel);
                self.queues.not_full.notify_waiters();
                return Some(element);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }
}

impl Queues {
    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Element;

    #[tokio::test]
    async fn dequeues_strictly_by_priority_regardless_of_insertion_order() {
        let ctx = RunContext::new();
        let (tx, mut rx) = priority_channel(8);

        tx.send(&ctx, Element::new_text("l").with_priority(Priority::Low))
            .await
            .unwrap();
        tx.send(&ctx, Element::new_text("n").with_priority(Priority::Normal))
            .await
            .unwrap();
        tx.send(&ctx, Element::new_text("c").with_priority(Priority::Critical))
            .await
            .unwrap();
        tx.send(&ctx, Element::new_text("h").with_priority(Priority::High))
            .await
            .unwrap();

        let order = [
            rx.recv(&ctx).await.unwrap().extract_text().unwrap(),
            rx.recv(&ctx).await.unwrap().extract_text().unwrap(),
            rx.recv(&ctx).await.unwrap().extract_text().unwrap(),
            rx.recv(&ctx).await.unwrap().extract_text().unwrap(),
        ];
        assert_eq!(order, ["c", "h", "n", "l"]);
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let ctx = RunContext::new();
        let (tx, mut rx) = priority_channel(4);
        tx.send(&ctx, Element::new_text("x")).await.unwrap();
        tx.close();
        assert!(rx.recv(&ctx).await.is_some());
        assert!(rx.recv(&ctx).await.is_none());
    }
}
