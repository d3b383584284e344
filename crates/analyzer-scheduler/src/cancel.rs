// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cooperative job cancellation, mirroring `abp_runtime::cancel::CancellationToken`:
//! in-flight units are signalled to stop but not killed; the scheduler waits
//! for each to return before recording it as cancelled (§4.3).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Why a job was cancelled, carried through to the terminal `job.failed`
/// event's diagnostic context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationReason {
    /// The caller explicitly requested cancellation.
    Requested,
    /// The host process is shutting down.
    Shutdown,
}

struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cheaply cloneable, idempotent cancellation signal shared between the
/// scheduler loop and every in-flight worker task for one job.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Create a token in the not-yet-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner { cancelled: AtomicBool::new(false), notify: Notify::new() }) }
    }

    /// Signal cancellation. Idempotent: a second call is a no-op.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether cancellation has been signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`CancellationToken::cancel`] has been called.
    /// Resolves immediately if it already has been.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_after_cancel_is_called() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        assert!(!token.is_cancelled());
        token.cancel();
        handle.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_if_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancelled().await;
    }

    #[test]
    fn cancel_is_idempotent() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }
}
