//! Core types for the hub
//!
//! This crate provides the value types shared between the coordinator
//! helpers, the state store and the config entry layer: [`EntityId`],
//! [`State`], [`Context`] and the setup outcome taxonomy
//! [`ConfigEntryError`].

mod context;
mod entity_id;
mod exceptions;
mod state;

pub use context::Context;
pub use entity_id::{EntityId, EntityIdError};
pub use exceptions::ConfigEntryError;
pub use state::State;

/// Maximum length for a state value
pub const MAX_STATE_LENGTH: usize = 255;

/// State value of an entity whose data source cannot be trusted
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// State value of an entity without a known value
pub const STATE_UNKNOWN: &str = "unknown";
