//! Home Assistant Rust Server
//!
//! Loads configuration.yaml, sets up one demo config entry per configured
//! device and runs until interrupted.

mod config;
mod demo;

use std::sync::Arc;

use anyhow::Result;
use ha_config_entries::ConfigEntries;
use ha_helpers::CoordinatorRegistry;
use ha_state_store::{SharedStateStore, StateStore};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Configuration;
use crate::demo::DemoIntegration;

const DEFAULT_CONFIG_PATH: &str = "configuration.yaml";

/// The central Home Assistant instance
pub struct HomeAssistant {
    /// Latest state of every entity
    pub states: SharedStateStore,
    /// Configured integration instances
    pub config_entries: Arc<ConfigEntries>,
    /// Coordinators shared by the integrations
    pub coordinators: Arc<CoordinatorRegistry>,
}

impl HomeAssistant {
    /// Create a new Home Assistant instance
    pub fn new() -> Self {
        Self {
            states: Arc::new(StateStore::new()),
            config_entries: ConfigEntries::new(),
            coordinators: Arc::new(CoordinatorRegistry::new()),
        }
    }

    /// Register the integrations and add the configured entries
    pub fn load(&self, config: &Configuration) -> Result<()> {
        self.config_entries.register_integration(Arc::new(DemoIntegration::new(
            self.states.clone(),
            self.coordinators.clone(),
            &self.config_entries,
        )));

        for device in &config.demo {
            self.config_entries.add(demo::config_entry(device))?;
        }
        Ok(())
    }

    /// Set up every entry, oldest first
    pub async fn start(&self) {
        for (entry_id, outcome) in self.config_entries.setup_all().await {
            match outcome {
                Ok(state) => debug!("Entry {} is {:?}", entry_id, state),
                Err(e) => warn!("Could not set up entry {}: {}", entry_id, e),
            }
        }
    }

    /// Unload every entry, newest first, and stop all coordinators
    pub async fn stop(&self) {
        for (entry_id, outcome) in self.config_entries.unload_all().await {
            if let Err(e) = outcome {
                warn!("Could not unload entry {}: {}", entry_id, e);
            }
        }
        self.coordinators.shutdown_all();
    }
}

impl Default for HomeAssistant {
    fn default() -> Self {
        Self::new()
    }
}

fn init_tracing(config: &Configuration) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logger.default))?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Log every state write until the store goes away
fn spawn_state_logger(states: &SharedStateStore) {
    let mut changes = states.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => match change.new_state {
                    Some(state) => debug!("{} = {}", change.entity_id, state.state),
                    None => debug!("{} removed", change.entity_id),
                },
                Err(RecvError::Lagged(skipped)) => {
                    debug!("State logger skipped {} changes", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Configuration::load(&path)?;
    init_tracing(&config)?;

    info!("Starting Home Assistant (Rust)");

    let hass = HomeAssistant::new();
    spawn_state_logger(&hass.states);
    hass.load(&config)?;

    info!(
        "{} initialized with {} config entries",
        config.homeassistant.name,
        hass.config_entries.len()
    );

    hass.start().await;

    info!("Home Assistant is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    hass.stop().await;

    Ok(())
}
