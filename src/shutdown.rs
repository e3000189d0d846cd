//! Graceful shutdown coordination.
//!
//! A [`ShutdownHandle`] is cloned into the scheduler, the deferred-queue
//! ticker and every worker. Requesting shutdown is idempotent; waiters are
//! woken exactly once and late subscribers return immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::info;

/// Reason a shutdown was requested, used for exit-code mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Operator interrupt (Ctrl-C / SIGINT).
    Interrupt,
    /// Budget policy `stop` tripped.
    BudgetStop,
}

#[derive(Debug, Default)]
struct Inner {
    requested: AtomicBool,
    budget_stop: AtomicBool,
    notify: Notify,
}

/// Cloneable handle for requesting and observing shutdown.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    inner: Arc<Inner>,
}

impl ShutdownHandle {
    /// Creates a fresh, un-triggered handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown. The first caller wins; later calls are no-ops.
    pub fn request(&self, reason: ShutdownReason) {
        if reason == ShutdownReason::BudgetStop {
            self.inner.budget_stop.store(true, Ordering::SeqCst);
        }
        if !self.inner.requested.swap(true, Ordering::SeqCst) {
            info!(?reason, "shutdown requested");
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Whether the shutdown was caused by a budget stop.
    #[must_use]
    pub fn is_budget_stop(&self) -> bool {
        self.inner.budget_stop.load(Ordering::SeqCst)
    }

    /// Waits until shutdown is requested. Returns immediately if it
    /// already was.
    pub async fn wait(&self) {
        if self.is_requested() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_requested() {
            return;
        }
        notified.await;
    }
}
