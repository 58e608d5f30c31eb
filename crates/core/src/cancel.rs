//! Cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::EngineError;

type Subscriber = Box<dyn FnOnce() + Send>;

struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
    subscribers: Mutex<Vec<Subscriber>>,
}

/// A one-shot cancelled flag with subscribers.
///
/// `cancel` is idempotent; subscribers added after cancellation run
/// immediately. Cooperative callers check [`CancelToken::throw_if_cancelled`]
/// at well-defined points (before a kernel call, between stream tokens,
/// between retry sleeps); async callers can also await
/// [`CancelToken::cancelled`] inside a `select!`.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Trip the flag, run subscribers, and wake waiters. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        let subscribers = {
            let mut guard = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for subscriber in subscribers {
            subscriber();
        }

        self.inner.notify.notify_waiters();
    }

    /// Whether the flag has been tripped.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the flag is tripped.
    pub fn throw_if_cancelled(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::cancelled())
        } else {
            Ok(())
        }
    }

    /// Run `f` when the token is cancelled. Runs immediately (on the calling
    /// thread) if cancellation already happened.
    pub fn on_cancel(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_cancelled() {
            f();
            return;
        }

        let mut guard = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        // Re-check under the lock: cancel() drains subscribers exactly once.
        if self.inner.cancelled.load(Ordering::SeqCst) {
            drop(guard);
            f();
            return;
        }
        guard.push(Box::new(f));
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
