//! Config entry types
//!
//! A [`ConfigEntry`] holds the connection parameters of one integration
//! instance, e.g. one printer or one cloud account, together with its
//! runtime lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::state_machine::InvalidTransition;

/// Config entry lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryState {
    /// Not set up
    #[default]
    NotLoaded,
    /// The integration's setup is running
    SetupInProgress,
    /// Set up and running
    Loaded,
    /// Setup failed and will not be retried automatically
    SetupError,
    /// The device was not ready; setup is retried with backoff
    SetupRetry,
    /// The integration's unload is running
    UnloadInProgress,
    /// The integration refused to unload
    FailedUnload,
}

impl ConfigEntryState {
    /// Whether the entry can be unloaded or reloaded from this state
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConfigEntryState::NotLoaded
                | ConfigEntryState::Loaded
                | ConfigEntryState::SetupError
                | ConfigEntryState::SetupRetry
        )
    }
}

/// How the entry was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntrySource {
    /// Created by the user
    #[default]
    User,
    /// Imported from configuration.yaml
    Import,
    /// Created from a discovered device
    Discovery,
}

/// Reason an entry was disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryDisabledBy {
    User,
}

/// One configured integration instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Unique identifier (ULID)
    pub entry_id: String,

    /// Integration domain, e.g. "demo"
    pub domain: String,

    /// Human-readable name
    pub title: String,

    /// Connection parameters
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,

    /// User-tunable options
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,

    /// Identifies the device or account across entries of one domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    #[serde(default)]
    pub source: ConfigEntrySource,

    /// Lifecycle state (not persisted)
    #[serde(skip, default)]
    pub state: ConfigEntryState,

    /// Why the entry is in a failed or retry state
    #[serde(skip, default)]
    pub reason: Option<String>,

    /// Serializes setup and unload of this entry
    #[serde(skip)]
    pub setup_lock: Arc<Mutex<()>>,

    /// Consecutive not-ready setup attempts (not persisted)
    #[serde(skip, default)]
    pub tries: u32,

    /// Integrations must not poll this entry's devices
    #[serde(default)]
    pub pref_disable_polling: bool,

    /// Credentials were rejected and the user has to re-authenticate
    #[serde(skip, default)]
    pub reauth_requested: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<ConfigEntryDisabledBy>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl ConfigEntry {
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entry_id: ulid::Ulid::new().to_string(),
            domain: domain.into(),
            title: title.into(),
            data: HashMap::new(),
            options: HashMap::new(),
            unique_id: None,
            source: ConfigEntrySource::User,
            state: ConfigEntryState::NotLoaded,
            reason: None,
            setup_lock: Arc::new(Mutex::new(())),
            tries: 0,
            pref_disable_polling: false,
            reauth_requested: false,
            disabled_by: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_data(mut self, data: HashMap<String, serde_json::Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_options(mut self, options: HashMap<String, serde_json::Value>) -> Self {
        self.options = options;
        self
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_source(mut self, source: ConfigEntrySource) -> Self {
        self.source = source;
        self
    }

    pub fn with_polling_disabled(mut self, disabled: bool) -> Self {
        self.pref_disable_polling = disabled;
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.state == ConfigEntryState::Loaded
    }

    /// Read a typed value from `data`
    pub fn data_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Move to `new_state` if the lifecycle allows it
    ///
    /// Leaving the setup/retry loop resets the retry counter.
    pub fn try_set_state(
        &mut self,
        new_state: ConfigEntryState,
        reason: Option<String>,
    ) -> Result<(), InvalidTransition> {
        self.state = self.state.try_transition(new_state)?;
        self.reason = reason;
        self.modified_at = Utc::now();

        if !matches!(
            new_state,
            ConfigEntryState::SetupRetry | ConfigEntryState::SetupInProgress
        ) {
            self.tries = 0;
        }
        Ok(())
    }

    /// Count a not-ready attempt, returning the count before this one
    pub fn increment_tries(&mut self) -> u32 {
        let previous = self.tries;
        self.tries += 1;
        previous
    }
}
