//! Message kind to handler dispatch
//!
//! Push-based integrations receive device messages of a handful of kinds.
//! A [`DispatchTable`] is built once at setup and maps each kind to its
//! handler, so dispatching is a map lookup on an enum key.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tracing::debug;

/// A message that knows its own kind
pub trait Tagged {
    /// The kind discriminant, usually a field-less enum
    type Kind: Copy + Eq + Hash + fmt::Debug;

    fn kind(&self) -> Self::Kind;
}

type Handler<M> = Arc<dyn Fn(&M) + Send + Sync>;

/// Handlers keyed by message kind
pub struct DispatchTable<M: Tagged> {
    handlers: HashMap<M::Kind, Handler<M>>,
}

impl<M: Tagged> DispatchTable<M> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for a kind, replacing any previous one
    pub fn register<F>(mut self, kind: M::Kind, handler: F) -> Self
    where
        F: Fn(&M) + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Whether a handler is registered for `kind`
    pub fn contains(&self, kind: M::Kind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Hand `message` to the handler for its kind
    ///
    /// Returns `false` when no handler is registered for the kind.
    pub fn dispatch(&self, message: &M) -> bool {
        let kind = message.kind();
        match self.handlers.get(&kind) {
            Some(handler) => {
                handler(message);
                true
            }
            None => {
                debug!(?kind, "No handler registered for message kind");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<M: Tagged> Default for DispatchTable<M> {
    fn default() -> Self {
        Self::new()
    }
}
