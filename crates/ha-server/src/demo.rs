//! Demo integration
//!
//! Simulated devices that exercise the coordinator stack without real
//! hardware. A device with a `scan_interval` is polled by its coordinator;
//! a device without one pushes readings that are routed through a
//! [`DispatchTable`] into the coordinator's data.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ha_config_entries::{ConfigEntries, ConfigEntry, ConfigEntrySource, Integration};
use ha_core::{ConfigEntryError, EntityId};
use ha_helpers::{
    track_time_interval, CoordinatorConfig, CoordinatorEntity, CoordinatorRegistry,
    DataUpdateCoordinator, DispatchTable, ScheduledCall, Tagged, UpdateError, UpdateMethod,
    REQUEST_REFRESH_DEFAULT_COOLDOWN,
};
use ha_state_store::SharedStateStore;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::config::DemoDeviceConfig;

pub const DOMAIN: &str = "demo";

/// How often a push device emits a message
const PUSH_PERIOD: Duration = Duration::from_secs(5);

/// Latest value of every sensor of one device
pub type Readings = HashMap<String, f64>;

/// Build the config entry for a configured device
pub fn config_entry(device: &DemoDeviceConfig) -> ConfigEntry {
    let data = match serde_json::to_value(device) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        _ => HashMap::new(),
    };

    ConfigEntry::new(DOMAIN, device.name.clone())
        .with_unique_id(device.name.to_lowercase())
        .with_source(ConfigEntrySource::Import)
        .with_data(data)
}

/// Messages a push device sends
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    /// One sensor changed
    Reading { sensor: String, value: f64 },
    /// Full state of the device
    Snapshot(Readings),
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceMessageKind {
    Reading,
    Snapshot,
    Heartbeat,
}

impl Tagged for DeviceMessage {
    type Kind = DeviceMessageKind;

    fn kind(&self) -> DeviceMessageKind {
        match self {
            DeviceMessage::Reading { .. } => DeviceMessageKind::Reading,
            DeviceMessage::Snapshot(_) => DeviceMessageKind::Snapshot,
            DeviceMessage::Heartbeat => DeviceMessageKind::Heartbeat,
        }
    }
}

/// Route push messages into `coordinator`
pub fn message_table(coordinator: DataUpdateCoordinator<Readings>) -> DispatchTable<DeviceMessage> {
    DispatchTable::new()
        .register(DeviceMessageKind::Snapshot, {
            let coordinator = coordinator.clone();
            move |message: &DeviceMessage| {
                if let DeviceMessage::Snapshot(readings) = message {
                    coordinator.set_updated_data(readings.clone());
                }
            }
        })
        .register(DeviceMessageKind::Reading, {
            let coordinator = coordinator.clone();
            move |message: &DeviceMessage| {
                if let DeviceMessage::Reading { sensor, value } = message {
                    let mut readings = coordinator
                        .data()
                        .map(|data| data.as_ref().clone())
                        .unwrap_or_default();
                    readings.insert(sensor.clone(), *value);
                    coordinator.set_updated_data(readings);
                }
            }
        })
        .register(DeviceMessageKind::Heartbeat, move |_: &DeviceMessage| {
            trace!(device = coordinator.name(), "Heartbeat");
        })
}

/// Typical value and spread of a sensor
fn baseline(sensor: &str) -> (f64, f64) {
    match sensor {
        "temperature" => (21.0, 1.5),
        "humidity" => (45.0, 5.0),
        "toner" => (60.0, 0.5),
        "pages" => (1200.0, 0.0),
        _ => (50.0, 10.0),
    }
}

fn unit_of_measurement(sensor: &str) -> Option<&'static str> {
    match sensor {
        "temperature" => Some("°C"),
        "humidity" | "toner" => Some("%"),
        _ => None,
    }
}

/// A device that answers with random readings around a baseline
pub struct SimulatedDevice {
    name: String,
    sensors: Vec<String>,
    fail_every: Option<u32>,
    fetches: AtomicU32,
}

impl SimulatedDevice {
    pub fn new(config: &DemoDeviceConfig) -> Self {
        Self {
            name: config.name.clone(),
            sensors: config.sensors.clone(),
            fail_every: config.fail_every,
            fetches: AtomicU32::new(0),
        }
    }

    fn sample(&self, sensor: &str) -> f64 {
        let (base, spread) = baseline(sensor);
        let value = base + rand::thread_rng().gen_range(-spread..=spread);
        (value * 10.0).round() / 10.0
    }

    /// Current value of every sensor
    pub fn snapshot(&self) -> Readings {
        self.sensors
            .iter()
            .map(|sensor| (sensor.clone(), self.sample(sensor)))
            .collect()
    }

    /// The next message the device pushes
    pub fn next_message(&self) -> DeviceMessage {
        let mut rng = rand::thread_rng();
        match rng.gen_range(0..10) {
            0 => DeviceMessage::Heartbeat,
            1 => DeviceMessage::Snapshot(self.snapshot()),
            _ => {
                let sensor = self.sensors[rng.gen_range(0..self.sensors.len())].clone();
                let value = self.sample(&sensor);
                DeviceMessage::Reading { sensor, value }
            }
        }
    }
}

#[async_trait]
impl UpdateMethod<Readings> for SimulatedDevice {
    async fn update(&self) -> Result<Readings, UpdateError> {
        let fetch = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_every.is_some_and(|every| fetch % every == 0) {
            return Err(UpdateError::failed(format!("{} did not respond", self.name)));
        }
        Ok(self.snapshot())
    }
}

/// What a loaded entry keeps alive
struct LoadedDevice {
    entities: Vec<Arc<CoordinatorEntity<Readings>>>,
    push: Option<ScheduledCall>,
}

/// Sets up one coordinator and one sensor entity per sensor for each entry
pub struct DemoIntegration {
    states: SharedStateStore,
    coordinators: Arc<CoordinatorRegistry>,
    config_entries: Weak<ConfigEntries>,
    loaded: DashMap<String, LoadedDevice>,
}

impl DemoIntegration {
    pub fn new(
        states: SharedStateStore,
        coordinators: Arc<CoordinatorRegistry>,
        config_entries: &Arc<ConfigEntries>,
    ) -> Self {
        Self {
            states,
            coordinators,
            config_entries: Arc::downgrade(config_entries),
            loaded: DashMap::new(),
        }
    }

    fn coordinator_config(
        &self,
        entry: &ConfigEntry,
        device: &DemoDeviceConfig,
        update_method: Arc<dyn UpdateMethod<Readings>>,
    ) -> CoordinatorConfig<Readings> {
        let entry_id = entry.entry_id.clone();
        let config_entries = self.config_entries.clone();

        let config = CoordinatorConfig::new(device.name.clone(), update_method)
            .with_request_refresh_debouncer(REQUEST_REFRESH_DEFAULT_COOLDOWN, true)
            .with_auth_failed_hook(move |_| {
                let Some(config_entries) = config_entries.upgrade() else {
                    return;
                };
                if let Err(e) = config_entries.start_reauth(&entry_id) {
                    warn!("Could not start reauth for {}: {}", entry_id, e);
                }
            });

        match device.scan_interval {
            Some(secs) if !entry.pref_disable_polling => {
                config.with_update_interval(Duration::from_secs(secs))
            }
            _ => config,
        }
    }

    fn sensor_entity(
        &self,
        device: &DemoDeviceConfig,
        sensor: &str,
        coordinator: &DataUpdateCoordinator<Readings>,
    ) -> Result<CoordinatorEntity<Readings>, ConfigEntryError> {
        let name = format!("{} {}", device.name, sensor);
        let entity_id = EntityId::from_name("sensor", &name)
            .map_err(|e| ConfigEntryError::Failed(e.to_string()))?;

        let key = sensor.to_string();
        let unit = unit_of_measurement(sensor);
        Ok(CoordinatorEntity::new(
            entity_id,
            coordinator.clone(),
            self.states.clone(),
            move |readings: &Readings| readings.get(&key).map(|value| format!("{value:.1}")),
        )
        .with_name(name)
        .with_attributes(move |_: &Readings| {
            unit.map(|unit| {
                HashMap::from([(
                    "unit_of_measurement".to_string(),
                    Value::String(unit.to_string()),
                )])
            })
            .unwrap_or_default()
        }))
    }
}

#[async_trait]
impl Integration for DemoIntegration {
    fn domain(&self) -> &str {
        DOMAIN
    }

    async fn async_setup_entry(&self, entry: &ConfigEntry) -> Result<(), ConfigEntryError> {
        let device: DemoDeviceConfig =
            serde_json::from_value(Value::Object(entry.data.clone().into_iter().collect()))
                .map_err(|e| ConfigEntryError::Failed(format!("invalid device data: {e}")))?;

        let simulated = Arc::new(SimulatedDevice::new(&device));
        let config = self.coordinator_config(entry, &device, simulated.clone());
        let coordinator = self
            .coordinators
            .get_or_insert_with(&entry.entry_id, || DataUpdateCoordinator::new(config))
            .map_err(|e| ConfigEntryError::Failed(e.to_string()))?;

        if let Err(e) = coordinator.first_refresh().await {
            self.coordinators.remove(&entry.entry_id);
            return Err(e);
        }

        let entities = match device
            .sensors
            .iter()
            .map(|sensor| self.sensor_entity(&device, sensor, &coordinator).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(entities) => entities,
            Err(e) => {
                self.coordinators.remove(&entry.entry_id);
                return Err(e);
            }
        };
        for entity in &entities {
            entity.async_added_to_hass();
        }

        let push = device.scan_interval.is_none().then(|| {
            let table = Arc::new(message_table(coordinator.clone()));
            track_time_interval(PUSH_PERIOD, move || {
                let message = simulated.next_message();
                table.dispatch(&message);
                async {}
            })
        });

        info!(
            "Set up {} with {} sensors ({})",
            device.name,
            entities.len(),
            if push.is_some() { "push" } else { "polling" }
        );
        self.loaded
            .insert(entry.entry_id.clone(), LoadedDevice { entities, push });
        Ok(())
    }

    async fn async_unload_entry(&self, entry: &ConfigEntry) -> bool {
        if let Some((_, loaded)) = self.loaded.remove(&entry.entry_id) {
            if let Some(push) = loaded.push {
                push.cancel();
            }
            for entity in &loaded.entities {
                entity.async_will_remove_from_hass();
            }
        }
        self.coordinators.remove(&entry.entry_id);
        debug!("Unloaded {}", entry.title);
        true
    }
}
