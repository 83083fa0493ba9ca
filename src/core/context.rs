//! Run-context cancellation.
//!
//! `CancellationToken` is a small hand-rolled primitive rather than a
//! `tokio-util` dependency: flag plus `Notify`, cloneable, cheap to check.
//! `RunContext` adds an optional execution deadline on top, so every stage's
//! select loop only ever needs to watch one future (`ctx.cancelled()`) to
//! observe both explicit cancellation and timeout expiry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }

    /// A child token that is cancelled when either it or its parent is
    /// cancelled. Used to derive a per-execution token from the process-wide
    /// shutdown token without entangling their lifetimes.
    pub fn child(&self) -> Self {
        let child = CancellationToken::new();
        let parent = self.clone();
        let link = child.clone();
        tokio::spawn(async move {
            parent.cancelled().await;
            link.cancel();
        });
        child
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The context threaded through every `Stage::run` call.
#[derive(Clone)]
pub struct RunContext {
    token: CancellationToken,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn from_token(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Derive a context that is also cancelled after `timeout` elapses,
    /// reporting [`crate::error::RuntimeError::ExecutionTimeoutExceeded`]
    /// to anyone watching the returned watchdog handle.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let child = self.token.child();
        let watchdog = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watchdog.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    tracing::warn!("execution timeout of {:?} exceeded, cancelling", timeout);
                    watchdog.cancel();
                }
            }
        });
        Self { token: child }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}
