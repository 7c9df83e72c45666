//! Config Entries Manager
//!
//! Runs integration setup and unload for config entries and turns setup
//! outcomes into lifecycle states: a not-ready device is retried with
//! backoff, rejected credentials start re-authentication.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ha_core::ConfigEntryError;
use ha_helpers::{call_later, ScheduledCall};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::entry::{ConfigEntry, ConfigEntryState};
use crate::state_machine::{calculate_retry_delay, InvalidTransition};

/// Config entries errors
#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists for domain {domain} with unique_id {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("No integration registered for domain {0}")]
    UnknownIntegration(String),

    #[error("Cannot unload entry in state {0:?}")]
    CannotUnload(ConfigEntryState),

    #[error("Integration {0} failed to unload")]
    UnloadFailed(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

/// The setup side of an integration
#[async_trait]
pub trait Integration: Send + Sync {
    /// Domain whose entries this integration sets up
    fn domain(&self) -> &str;

    /// Connect to the entry's device and start its entities
    ///
    /// A device that cannot be reached yet reports
    /// [`ConfigEntryError::NotReady`]; rejected credentials report
    /// [`ConfigEntryError::AuthFailed`].
    async fn async_setup_entry(&self, entry: &ConfigEntry) -> Result<(), ConfigEntryError>;

    /// Stop the entry's entities and coordinators; `false` if that failed
    async fn async_unload_entry(&self, entry: &ConfigEntry) -> bool;
}

/// Config Entries Manager
///
/// Entries live in memory only. Handed out as `Arc` because scheduled setup
/// retries call back into the manager.
pub struct ConfigEntries {
    weak_self: Weak<ConfigEntries>,

    /// Primary index: entry_id -> ConfigEntry
    entries: DashMap<String, ConfigEntry>,

    /// entry_ids in the order they were added
    order: Mutex<Vec<String>>,

    /// Index: domain -> set of entry_ids
    by_domain: DashMap<String, HashSet<String>>,

    /// Index: (domain, unique_id) -> entry_id
    by_unique_id: DashMap<(String, String), String>,

    /// Integrations by domain
    integrations: DashMap<String, Arc<dyn Integration>>,

    /// Scheduled setup retries by entry_id
    pending_retries: DashMap<String, ScheduledCall>,
}

impl ConfigEntries {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            entries: DashMap::new(),
            order: Mutex::new(Vec::new()),
            by_domain: DashMap::new(),
            by_unique_id: DashMap::new(),
            integrations: DashMap::new(),
            pending_retries: DashMap::new(),
        })
    }

    fn index_entry(&self, entry: &ConfigEntry) {
        let entry_id = entry.entry_id.clone();
        if self.entries.insert(entry_id.clone(), entry.clone()).is_none() {
            self.order
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(entry_id.clone());
        }

        self.by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry_id.clone());

        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .insert((entry.domain.clone(), unique_id.clone()), entry_id);
        }
    }

    fn unindex_entry(&self, entry: &ConfigEntry) {
        if let Some(mut ids) = self.by_domain.get_mut(&entry.domain) {
            ids.remove(&entry.entry_id);
        }
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .remove(&(entry.domain.clone(), unique_id.clone()));
        }
        self.entries.remove(&entry.entry_id);
        self.order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|id| id != &entry.entry_id);
    }

    /// Get an entry by ID
    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|r| r.value().clone())
    }

    /// Get all entries for a domain, oldest first
    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        let Some(ids) = self.by_domain.get(domain).map(|ids| ids.clone()) else {
            return Vec::new();
        };
        self.entry_ids()
            .iter()
            .filter(|id| ids.contains(*id))
            .filter_map(|id| self.get(id))
            .collect()
    }

    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        self.by_unique_id
            .get(&(domain.to_string(), unique_id.to_string()))
            .and_then(|entry_id| self.get(&entry_id))
    }

    /// All entry IDs, oldest first
    pub fn entry_ids(&self) -> Vec<String> {
        self.order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries waiting for the user to re-authenticate
    pub fn reauth_entries(&self) -> Vec<ConfigEntry> {
        self.entry_ids()
            .iter()
            .filter_map(|id| self.get(id))
            .filter(|entry| entry.reauth_requested)
            .collect()
    }

    /// Whether a setup retry is scheduled for the entry
    pub fn has_pending_retry(&self, entry_id: &str) -> bool {
        self.pending_retries.contains_key(entry_id)
    }

    /// Add a new config entry
    pub fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(ref unique_id) = entry.unique_id {
            if self.get_by_unique_id(&entry.domain, unique_id).is_some() {
                return Err(ConfigEntriesError::AlreadyExists {
                    domain: entry.domain.clone(),
                    unique_id: unique_id.clone(),
                });
            }
        }

        self.index_entry(&entry);
        info!(
            "Added config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry.entry_id
        );
        Ok(entry)
    }

    /// Unload and forget an entry
    pub async fn remove(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        self.unload(entry_id).await?;
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        self.unindex_entry(&entry);
        info!(
            "Removed config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry_id
        );
        Ok(entry)
    }

    /// Register the integration handling a domain
    pub fn register_integration(&self, integration: Arc<dyn Integration>) {
        let domain = integration.domain().to_string();
        debug!("Registered integration for domain: {}", domain);
        self.integrations.insert(domain, integration);
    }

    pub fn has_integration(&self, domain: &str) -> bool {
        self.integrations.contains_key(domain)
    }

    /// Ask the user to re-authenticate an entry
    ///
    /// Called when setup or a running coordinator reports rejected
    /// credentials. Requests for an entry already awaiting re-authentication
    /// are ignored.
    pub fn start_reauth(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        let mut entry = self
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if entry.reauth_requested {
            debug!("Reauthentication already requested for entry {}", entry_id);
            return Ok(());
        }
        entry.reauth_requested = true;
        warn!(
            "Config entry {} ({}) needs to be re-authenticated",
            entry.title, entry.domain
        );
        Ok(())
    }

    /// Set up an entry, returning the state it ends in
    ///
    /// Setup outcomes are states, not errors: a not-ready device leaves the
    /// entry in [`ConfigEntryState::SetupRetry`] with a retry scheduled,
    /// rejected credentials and other failures leave it in
    /// [`ConfigEntryState::SetupError`]. Errors are reserved for unknown
    /// entries, unknown integrations and invalid lifecycle steps.
    pub async fn setup(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntryState> {
        let lock = self.setup_lock(entry_id)?;
        let _guard = lock.lock().await;
        self.setup_locked(entry_id).await
    }

    /// Scheduled retry; a no-op if the entry left `SetupRetry` meanwhile
    async fn retry_setup(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntryState> {
        let lock = self.setup_lock(entry_id)?;
        let _guard = lock.lock().await;

        let state = self.state_of(entry_id)?;
        if state != ConfigEntryState::SetupRetry {
            debug!("Skipping setup retry of entry {} in state {:?}", entry_id, state);
            return Ok(state);
        }
        self.setup_locked(entry_id).await
    }

    async fn setup_locked(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntryState> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if entry.is_disabled() {
            debug!("Skipping setup for disabled entry: {}", entry_id);
            return Ok(entry.state);
        }

        let integration = self
            .integrations
            .get(&entry.domain)
            .map(|r| r.value().clone())
            .ok_or_else(|| ConfigEntriesError::UnknownIntegration(entry.domain.clone()))?;

        self.cancel_retry(entry_id);
        let entry = self.transition(entry_id, ConfigEntryState::SetupInProgress, None)?;

        match integration.async_setup_entry(&entry).await {
            Ok(()) => {
                self.transition(entry_id, ConfigEntryState::Loaded, None)?;
                if let Some(mut loaded) = self.entries.get_mut(entry_id) {
                    loaded.reauth_requested = false;
                }
                info!("Setup completed for entry: {} ({})", entry.title, entry_id);
                Ok(ConfigEntryState::Loaded)
            }
            Err(ConfigEntryError::NotReady(reason)) => {
                self.transition(entry_id, ConfigEntryState::SetupRetry, Some(reason.clone()))?;
                let tries = self
                    .entries
                    .get_mut(entry_id)
                    .map(|mut e| e.increment_tries())
                    .unwrap_or_default();
                let delay = calculate_retry_delay(tries);

                if tries == 0 {
                    warn!(
                        "Config entry {} for {} is not ready yet: {}; retrying in background",
                        entry.title, entry.domain, reason
                    );
                } else {
                    debug!(
                        "Config entry {} for {} is not ready yet: {}; retrying in {:?}",
                        entry.title, entry.domain, reason, delay
                    );
                }
                self.schedule_retry(entry_id, delay);
                Ok(ConfigEntryState::SetupRetry)
            }
            Err(ConfigEntryError::AuthFailed(reason)) => {
                warn!(
                    "Authentication failed while setting up {} ({}): {}",
                    entry.title, entry.domain, reason
                );
                self.transition(entry_id, ConfigEntryState::SetupError, Some(reason))?;
                self.start_reauth(entry_id)?;
                Ok(ConfigEntryState::SetupError)
            }
            Err(ConfigEntryError::Failed(reason)) => {
                warn!("Setup failed for entry {}: {}", entry_id, reason);
                self.transition(entry_id, ConfigEntryState::SetupError, Some(reason))?;
                Ok(ConfigEntryState::SetupError)
            }
        }
    }

    /// Unload an entry, returning the state it ends in
    pub async fn unload(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntryState> {
        let lock = self.setup_lock(entry_id)?;
        let _guard = lock.lock().await;

        self.cancel_retry(entry_id);
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if !entry.state.is_recoverable() {
            return Err(ConfigEntriesError::CannotUnload(entry.state));
        }
        if entry.state == ConfigEntryState::NotLoaded {
            return Ok(ConfigEntryState::NotLoaded);
        }

        let was_loaded = entry.is_loaded();
        self.transition(entry_id, ConfigEntryState::UnloadInProgress, None)?;

        // Failed setups left nothing running
        let unloaded = match self.integrations.get(&entry.domain).map(|r| r.value().clone()) {
            Some(integration) if was_loaded => integration.async_unload_entry(&entry).await,
            _ => true,
        };

        if !unloaded {
            self.transition(
                entry_id,
                ConfigEntryState::FailedUnload,
                Some("integration failed to unload".to_string()),
            )?;
            return Err(ConfigEntriesError::UnloadFailed(entry.domain));
        }

        self.transition(entry_id, ConfigEntryState::NotLoaded, None)?;
        info!("Unloaded entry: {} ({})", entry.title, entry_id);
        Ok(ConfigEntryState::NotLoaded)
    }

    /// Reload an entry (unload + setup)
    pub async fn reload(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntryState> {
        self.unload(entry_id).await?;
        self.setup(entry_id).await
    }

    /// Set up every entry, oldest first
    pub async fn setup_all(&self) -> Vec<(String, ConfigEntriesResult<ConfigEntryState>)> {
        let mut results = Vec::new();
        for entry_id in self.entry_ids() {
            let result = self.setup(&entry_id).await;
            if let Err(ref e) = result {
                warn!("Failed to setup entry {}: {}", entry_id, e);
            }
            results.push((entry_id, result));
        }
        results
    }

    /// Unload every entry, newest first
    pub async fn unload_all(&self) -> Vec<(String, ConfigEntriesResult<ConfigEntryState>)> {
        let mut results = Vec::new();
        for entry_id in self.entry_ids().into_iter().rev() {
            let result = self.unload(&entry_id).await;
            if let Err(ref e) = result {
                warn!("Failed to unload entry {}: {}", entry_id, e);
            }
            results.push((entry_id, result));
        }
        results
    }

    fn setup_lock(&self, entry_id: &str) -> ConfigEntriesResult<Arc<tokio::sync::Mutex<()>>> {
        self.entries
            .get(entry_id)
            .map(|e| e.setup_lock.clone())
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))
    }

    fn state_of(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntryState> {
        self.entries
            .get(entry_id)
            .map(|e| e.state)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))
    }

    fn transition(
        &self,
        entry_id: &str,
        state: ConfigEntryState,
        reason: Option<String>,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let mut entry = self
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        entry.try_set_state(state, reason)?;
        debug!("Entry {} state changed to {:?}", entry_id, state);
        Ok(entry.clone())
    }

    fn schedule_retry(&self, entry_id: &str, delay: Duration) {
        let weak = self.weak_self.clone();
        let id = entry_id.to_string();

        let retry = call_later(delay, move || async move {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            manager.pending_retries.remove(&id);
            if let Err(e) = manager.retry_setup(&id).await {
                warn!("Setup retry of entry {} failed: {}", id, e);
            }
        });

        if let Some(previous) = self.pending_retries.insert(entry_id.to_string(), retry) {
            previous.cancel();
        }
    }

    fn cancel_retry(&self, entry_id: &str) {
        if let Some((_, retry)) = self.pending_retries.remove(entry_id) {
            debug!("Cancelled setup retry of entry {}", entry_id);
            retry.cancel();
        }
    }
}

impl std::fmt::Debug for ConfigEntries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigEntries")
            .field("entries", &self.entries.len())
            .field("integrations", &self.integrations.len())
            .field("pending_retries", &self.pending_retries.len())
            .finish()
    }
}
