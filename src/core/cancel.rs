//! Cooperative cancellation token.
//!
//! One token is threaded through every blocking primitive of a transfer:
//! the buffer waits, the accept/done waits, and the send pump. Aborting
//! fires all current and future waiters; the first recorded reason wins.

use crate::core::error::EngineError;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// A cloneable cancellation token.
///
/// Clones share state: aborting any clone aborts them all.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    reason: Mutex<Option<EngineError>>,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort with an explicit reason. Idempotent: later reasons are ignored.
    pub fn abort(&self, reason: EngineError) {
        {
            let mut guard = self.inner.reason.lock().expect("cancel lock poisoned");
            if guard.is_some() {
                return;
            }
            *guard = Some(reason);
        }
        self.inner.notify.notify_waiters();
    }

    /// Abort with the default `Cancelled` reason.
    pub fn cancel(&self) {
        self.abort(EngineError::Cancelled);
    }

    pub fn aborted(&self) -> bool {
        self.inner.reason.lock().expect("cancel lock poisoned").is_some()
    }

    /// The abort reason, or `Cancelled` if the token has not fired.
    /// Callers use this to build their failure result after observing
    /// `aborted()` or waking from `cancelled()`.
    pub fn error(&self) -> EngineError {
        self.inner
            .reason
            .lock()
            .expect("cancel lock poisoned")
            .clone()
            .unwrap_or(EngineError::Cancelled)
    }

    /// Resolves once the token is aborted. Registers interest before
    /// checking the flag so an abort between the two cannot be missed.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.aborted() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("aborted", &self.aborted())
            .finish()
    }
}
