//! Shared coordinators
//!
//! Integrations that expose one connection through several platforms keep
//! a single coordinator per connection. The [`CoordinatorRegistry`] is
//! owned by the hub and handed to integrations explicitly; it maps a key,
//! typically the config entry id, to the coordinator for that key.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use crate::update_coordinator::DataUpdateCoordinator;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("coordinator {key} holds a different data type")]
    TypeMismatch { key: String },
}

trait ErasedCoordinator: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn name(&self) -> &str;
    fn shutdown(&self);
}

impl<T: Send + Sync + 'static> ErasedCoordinator for DataUpdateCoordinator<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn name(&self) -> &str {
        DataUpdateCoordinator::name(self)
    }

    fn shutdown(&self) {
        DataUpdateCoordinator::shutdown(self);
    }
}

/// Coordinators keyed by connection
#[derive(Default)]
pub struct CoordinatorRegistry {
    coordinators: DashMap<String, Arc<dyn ErasedCoordinator>>,
}

impl CoordinatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the coordinator stored under `key`, creating it if absent
    pub fn get_or_insert_with<T, F>(
        &self,
        key: &str,
        create: F,
    ) -> Result<DataUpdateCoordinator<T>, RegistryError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> DataUpdateCoordinator<T>,
    {
        let entry = self
            .coordinators
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key, "Registering coordinator");
                let coordinator: Arc<dyn ErasedCoordinator> = Arc::new(create());
                coordinator
            })
            .clone();
        downcast(key, entry.as_ref())
    }

    /// Get the coordinator stored under `key`
    pub fn get<T: Send + Sync + 'static>(
        &self,
        key: &str,
    ) -> Result<Option<DataUpdateCoordinator<T>>, RegistryError> {
        let Some(entry) = self.coordinators.get(key).map(|e| e.clone()) else {
            return Ok(None);
        };
        downcast(key, entry.as_ref()).map(Some)
    }

    /// Remove and shut down the coordinator stored under `key`
    pub fn remove(&self, key: &str) -> bool {
        match self.coordinators.remove(key) {
            Some((_, coordinator)) => {
                debug!(key, name = coordinator.name(), "Removing coordinator");
                coordinator.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.coordinators.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.coordinators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.is_empty()
    }

    /// Shut down and forget every coordinator
    pub fn shutdown_all(&self) {
        for key in self.keys() {
            self.remove(&key);
        }
    }
}

fn downcast<T: Send + Sync + 'static>(
    key: &str,
    coordinator: &dyn ErasedCoordinator,
) -> Result<DataUpdateCoordinator<T>, RegistryError> {
    coordinator
        .as_any()
        .downcast_ref::<DataUpdateCoordinator<T>>()
        .cloned()
        .ok_or_else(|| RegistryError::TypeMismatch {
            key: key.to_string(),
        })
}
