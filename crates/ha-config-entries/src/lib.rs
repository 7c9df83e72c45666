//! Config Entries
//!
//! Config entries represent individual integration instances and manage
//! their lifecycle (setup, unload, reload, re-authentication).
//!
//! # Key Types
//!
//! - [`ConfigEntry`] - A single integration configuration
//! - [`ConfigEntryState`] - Lifecycle state of an entry
//! - [`Integration`] - The setup/unload side of an integration
//! - [`ConfigEntries`] - Manager for all config entries
//!
//! Entries are kept in memory; callers add them at startup.

pub mod entry;
pub mod manager;
pub mod state_machine;

pub use entry::{ConfigEntry, ConfigEntryDisabledBy, ConfigEntrySource, ConfigEntryState};
pub use manager::{ConfigEntries, ConfigEntriesError, ConfigEntriesResult, Integration};
pub use state_machine::{calculate_retry_delay, InvalidTransition};
