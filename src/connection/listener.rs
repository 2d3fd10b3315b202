//! Listener registration and callback delivery
//!
//! Observers are held weakly: registering a listener never keeps it alive,
//! so components can listen to each other without ownership cycles. A
//! dropped listener is pruned on the next notification.
//!
//! Each listener may name a [`CallbackContext`]. Callbacks for such a
//! listener are posted to that context's FIFO queue instead of running on
//! the notifying task; listeners without one are called inline. A panicking
//! callback is logged and does not reach the notifier.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use super::ConnectionState;

type Callback = Box<dyn FnOnce() + Send>;

/// An execution context that runs posted callbacks in order
#[derive(Clone, Debug)]
pub struct CallbackContext {
    tx: mpsc::UnboundedSender<Callback>,
}

/// Receiving half of a [`CallbackContext`], driven by the owner
pub struct CallbackQueue {
    rx: mpsc::UnboundedReceiver<Callback>,
}

impl CallbackContext {
    /// Create a context and the queue that must be driven to run its callbacks
    pub fn channel() -> (Self, CallbackQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, CallbackQueue { rx })
    }

    /// Create a context drained by a task on the current tokio runtime
    pub fn spawn() -> Self {
        let (ctx, queue) = Self::channel();
        tokio::spawn(queue.run());
        ctx
    }

    /// Queue a callback. Returns `false` if the queue has been dropped.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(f)).is_ok()
    }
}

impl CallbackQueue {
    /// Run callbacks until every context handle is dropped
    pub async fn run(mut self) {
        while let Some(cb) = self.rx.recv().await {
            invoke(cb);
        }
    }

    /// Run callbacks on a non-runtime thread until every handle is dropped
    pub fn run_blocking(mut self) {
        while let Some(cb) = self.rx.blocking_recv() {
            invoke(cb);
        }
    }

    /// Run whatever is queued right now without waiting. Returns the count.
    pub fn run_pending(&mut self) -> usize {
        let mut count = 0;
        while let Ok(cb) = self.rx.try_recv() {
            invoke(cb);
            count += 1;
        }
        count
    }
}

/// Observer of connection state changes
pub trait ConnectionListener: Send + Sync {
    /// Context to deliver callbacks on; `None` means inline
    fn callback_context(&self) -> Option<CallbackContext> {
        None
    }

    fn on_connection_state_change(&self, state: ConnectionState);
}

/// Ordered, weakly-held set of listeners
pub(crate) struct ListenerSet<L: ?Sized> {
    kind: &'static str,
    listeners: Mutex<Vec<Weak<L>>>,
}

impl<L: ?Sized> ListenerSet<L> {
    pub(crate) fn new(kind: &'static str) -> Self {
        Self {
            kind,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener. Duplicates are ignored with a warning.
    pub(crate) fn add(&self, listener: &Arc<L>) -> bool {
        let mut listeners = lock(&self.listeners);
        let weak = Arc::downgrade(listener);
        if listeners.iter().any(|l| Weak::ptr_eq(l, &weak)) {
            tracing::warn!(kind = self.kind, "Attempted to add duplicate listener");
            return false;
        }
        listeners.push(weak);
        true
    }

    /// Remove a listener. Removing an unknown listener only warns.
    pub(crate) fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = lock(&self.listeners);
        let weak = Arc::downgrade(listener);
        match listeners.iter().position(|l| Weak::ptr_eq(l, &weak)) {
            Some(idx) => {
                listeners.remove(idx);
                true
            }
            None => {
                tracing::warn!(kind = self.kind, "Attempted to remove unknown listener");
                false
            }
        }
    }

    pub(crate) fn contains(&self, listener: &Arc<L>) -> bool {
        let weak = Arc::downgrade(listener);
        lock(&self.listeners).iter().any(|l| Weak::ptr_eq(l, &weak))
    }

    /// Live listeners in registration order; dead entries are pruned
    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        let mut listeners = lock(&self.listeners);
        listeners.retain(|l| l.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.listeners)
            .iter()
            .filter(|l| l.strong_count() > 0)
            .count()
    }
}

/// Run `f` for `listener`, inline or on its callback context
pub(crate) fn deliver<L>(
    listener: Arc<L>,
    context: Option<CallbackContext>,
    f: impl FnOnce(&L) + Send + 'static,
) where
    L: ?Sized + Send + Sync + 'static,
{
    match context {
        None => invoke(move || f(&listener)),
        Some(ctx) => {
            if !ctx.post(move || f(&listener)) {
                tracing::debug!("Callback context gone, dropping notification");
            }
        }
    }
}

/// Run one listener callback, containing any panic
fn invoke(f: impl FnOnce()) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let reason = panic
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("unknown");
        tracing::error!(panic = reason, "Listener callback panicked");
    }
}

/// Lock a mutex, recovering the data if a listener panicked while holding it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
