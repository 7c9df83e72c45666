//! Integration helpers
//!
//! The pieces an integration needs to poll a device or cloud API once and
//! fan the result out to many entities:
//!
//! - [`DataUpdateCoordinator`] - runs a fetch on an interval or on demand,
//!   coalesces concurrent refresh requests, tracks success/failure and
//!   notifies listeners after every cycle
//! - [`CoordinatorEntity`] - an entity that renders coordinator data into
//!   the state store
//! - [`Debouncer`] - cooldown-based coalescing of refresh requests
//! - [`event`] - cancellable delayed and periodic calls
//! - [`CoordinatorRegistry`] - explicitly owned sharing of coordinators
//! - [`DispatchTable`] - message kind to handler table for push updates

pub mod debounce;
pub mod dispatch;
pub mod entity;
pub mod event;
pub mod listeners;
pub mod registry;
mod sync;
pub mod update_coordinator;

pub use debounce::Debouncer;
pub use dispatch::{DispatchTable, Tagged};
pub use entity::CoordinatorEntity;
pub use event::{call_at, call_later, track_time_interval, ScheduledCall};
pub use listeners::{ListenerId, ListenerRegistry};
pub use registry::{CoordinatorRegistry, RegistryError};
pub use update_coordinator::{
    update_method_fn, CoordinatorConfig, DataUpdateCoordinator, ListenerHandle, UpdateError,
    UpdateMethod, REQUEST_REFRESH_DEFAULT_COOLDOWN,
};
