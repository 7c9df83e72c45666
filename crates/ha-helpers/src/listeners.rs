//! Listener registry
//!
//! An observer list of argument-less callbacks. Listeners are identified by
//! the [`ListenerId`] handed out on registration, never by comparing the
//! callbacks, so two entities registering identical-looking closures are
//! still removed independently.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::sync::lock;

type Callback = Arc<dyn Fn() + Send + Sync>;

/// A unique identifier for a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registered callbacks, invoked in registration order
pub struct ListenerRegistry {
    listeners: Mutex<BTreeMap<ListenerId, Callback>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback
    ///
    /// Returns the new listener's id and whether it is the only listener,
    /// i.e. whether the registry went from empty to non-empty.
    pub fn add<F>(&self, callback: F) -> (ListenerId, bool)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut listeners = lock(&self.listeners);
        listeners.insert(id, Arc::new(callback));
        trace!(listener = %id, count = listeners.len(), "Listener added");
        (id, listeners.len() == 1)
    }

    /// Unregister a callback
    ///
    /// Returns `None` if the id is not registered, otherwise whether the
    /// registry is now empty.
    pub fn remove(&self, id: ListenerId) -> Option<bool> {
        let mut listeners = lock(&self.listeners);
        listeners.remove(&id)?;
        trace!(listener = %id, count = listeners.len(), "Listener removed");
        Some(listeners.is_empty())
    }

    /// Invoke every registered callback, returning how many were called
    ///
    /// Callbacks run on a snapshot taken before the first one is invoked, so
    /// a callback may add or remove listeners; the change applies to the
    /// next notification.
    pub fn notify_all(&self) -> usize {
        let snapshot: Vec<Callback> = lock(&self.listeners).values().cloned().collect();
        for callback in &snapshot {
            callback();
        }
        snapshot.len()
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        lock(&self.listeners).is_empty()
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("len", &self.len())
            .finish()
    }
}
