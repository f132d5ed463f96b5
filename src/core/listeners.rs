//! Listener registry.
//!
//! Callbacks are registered with [`Listeners::subscribe`], which hands back a
//! [`Subscription`]. Dropping (or calling `unsubscribe` on) the subscription
//! removes the callback, so teardown is deterministic.
//!
//! Notification snapshots the handler list before calling out, which lets a
//! handler subscribe, unsubscribe or trigger another notification without
//! deadlocking.

use std::sync::{Arc, Weak};
use parking_lot::Mutex;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerSet<T> {
    next_id: u64,
    handlers: Vec<(u64, Handler<T>)>,
}

/// A set of callbacks invoked with `&T`.
pub struct Listeners<T> {
    inner: Arc<Mutex<ListenerSet<T>>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ListenerSet {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }
}

impl<T: 'static> Listeners<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut set = self.inner.lock();
            let id = set.next_id;
            set.next_id += 1;
            set.handlers.push((id, Arc::new(handler)));
            id
        };

        let weak: Weak<Mutex<ListenerSet<T>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().handlers.retain(|(hid, _)| *hid != id);
            }
        })
    }

    /// Invoke every registered callback with `value`.
    pub fn notify(&self, value: &T) {
        let handlers: Vec<Handler<T>> = self
            .inner
            .lock()
            .handlers
            .iter()
            .map(|(_, h)| h.clone())
            .collect();

        for handler in handlers {
            handler(value);
        }
    }

    /// Number of live callbacks.
    pub fn len(&self) -> usize {
        self.inner.lock().handlers.len()
    }

    /// True when nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle that removes a callback when dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Remove the callback now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
