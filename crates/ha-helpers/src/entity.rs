//! Coordinator-bound entities
//!
//! A [`CoordinatorEntity`] never polls on its own. It registers a listener
//! on its coordinator while it is part of the hub and re-renders its state
//! into the state store after every refresh cycle.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use ha_core::{Context, EntityId, State, STATE_UNAVAILABLE, STATE_UNKNOWN};
use ha_state_store::SharedStateStore;
use serde_json::Value;
use tracing::{debug, trace};

use crate::sync::lock;
use crate::update_coordinator::{DataUpdateCoordinator, ListenerHandle, UpdateError};

type ValueFn<T> = Arc<dyn Fn(&T) -> Option<String> + Send + Sync>;
type AttributesFn<T> = Arc<dyn Fn(&T) -> HashMap<String, Value> + Send + Sync>;

/// An entity whose state is derived from coordinator data
pub struct CoordinatorEntity<T> {
    entity_id: EntityId,
    name: Option<String>,
    coordinator: DataUpdateCoordinator<T>,
    states: SharedStateStore,
    value_fn: ValueFn<T>,
    attributes_fn: Option<AttributesFn<T>>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl<T: Send + Sync + 'static> CoordinatorEntity<T> {
    /// Create an entity rendering `value_fn(data)` as its state
    ///
    /// `value_fn` returns `None` when the payload has no value for this
    /// entity, which renders as `unknown`.
    pub fn new<F>(
        entity_id: EntityId,
        coordinator: DataUpdateCoordinator<T>,
        states: SharedStateStore,
        value_fn: F,
    ) -> Self
    where
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            entity_id,
            name: None,
            coordinator,
            states,
            value_fn: Arc::new(value_fn),
            attributes_fn: None,
            listener: Mutex::new(None),
        }
    }

    /// Set the friendly name written with every state
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Derive extra state attributes from the payload
    pub fn with_attributes<F>(mut self, attributes_fn: F) -> Self
    where
        F: Fn(&T) -> HashMap<String, Value> + Send + Sync + 'static,
    {
        self.attributes_fn = Some(Arc::new(attributes_fn));
        self
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn coordinator(&self) -> &DataUpdateCoordinator<T> {
        &self.coordinator
    }

    /// Coordinator entities are refreshed by their coordinator
    pub fn should_poll(&self) -> bool {
        false
    }

    /// Available while the coordinator's last cycle succeeded
    pub fn available(&self) -> bool {
        self.coordinator.last_update_success()
    }

    /// Value rendered from the latest payload, if any
    pub fn native_value(&self) -> Option<String> {
        self.coordinator.data().and_then(|data| (self.value_fn)(data.as_ref()))
    }

    /// The state string this entity would publish now
    pub fn state(&self) -> String {
        if !self.available() {
            return STATE_UNAVAILABLE.to_string();
        }
        self.native_value()
            .unwrap_or_else(|| STATE_UNKNOWN.to_string())
    }

    /// Whether the entity is currently listening to its coordinator
    pub fn is_added(&self) -> bool {
        lock(&self.listener).is_some()
    }

    /// Start following the coordinator and publish the current state
    ///
    /// The listener holds a weak reference, so dropping the entity without
    /// removing it only leaves an inert listener behind.
    pub fn async_added_to_hass(self: &Arc<Self>) {
        let mut listener = lock(&self.listener);
        if listener.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        *listener = Some(self.coordinator.add_listener(move || {
            if let Some(entity) = weak.upgrade() {
                entity.write_state();
            }
        }));
        drop(listener);

        debug!(entity_id = %self.entity_id, coordinator = self.coordinator.name(), "Entity added");
        self.write_state();
    }

    /// Stop following the coordinator and withdraw the published state
    pub fn async_will_remove_from_hass(&self) {
        let Some(handle) = lock(&self.listener).take() else {
            return;
        };
        handle.remove();
        self.states.remove(&self.entity_id, Context::new());
        debug!(entity_id = %self.entity_id, "Entity removed");
    }

    /// Manual update: ask the coordinator for a refresh
    pub async fn async_update(&self) -> Result<(), UpdateError> {
        self.coordinator.request_refresh().await
    }

    /// Publish the current state to the state store
    pub fn write_state(&self) -> State {
        let state = self.state();
        let mut attributes = self
            .coordinator
            .data()
            .zip(self.attributes_fn.as_ref())
            .map(|(data, attributes_fn)| attributes_fn(data.as_ref()))
            .unwrap_or_default();
        if let Some(name) = &self.name {
            attributes.insert("friendly_name".to_string(), Value::String(name.clone()));
        }

        trace!(entity_id = %self.entity_id, state = %state, "Writing state");
        self.states
            .set(self.entity_id.clone(), state, attributes, Context::new())
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for CoordinatorEntity<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorEntity")
            .field("entity_id", &self.entity_id)
            .field("name", &self.name)
            .field("coordinator", &self.coordinator.name())
            .finish()
    }
}
