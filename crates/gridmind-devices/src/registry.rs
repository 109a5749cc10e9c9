//! Device registry.
//!
//! Single source of truth for known devices and their availability state.
//! Every state transition is published on the event bus:
//!
//! ```text
//! Discovered ──success──▶ Online ◀──success── Offline
//!                           │                   ▲
//!                           └──N failures───────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use gridmind_core::{
    CommandedState, Device, DeviceDescriptor, DeviceState, DeviceStatus, Error, GridEvent,
    Reading, Result, SharedEventBus,
};

use crate::adapter::AdapterSet;
use crate::discovery::{discover_all, DiscoveryReport};

const EVENT_SOURCE: &str = "registry";

/// In-memory device registry.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
    bus: SharedEventBus,
    failure_threshold: u32,
}

pub type SharedDeviceRegistry = Arc<DeviceRegistry>;

impl DeviceRegistry {
    /// Create a registry. `failure_threshold` consecutive availability
    /// failures take a device offline (minimum 1).
    pub fn new(bus: SharedEventBus, failure_threshold: u32) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            bus,
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Insert a new device or refresh an existing one's metadata.
    ///
    /// Returns `true` when the device was not known before.
    pub async fn upsert(&self, descriptor: DeviceDescriptor) -> bool {
        let mut devices = self.devices.write().await;
        if let Some(existing) = devices.get_mut(&descriptor.id) {
            if existing.protocol != descriptor.protocol {
                tracing::warn!(
                    device_id = %descriptor.id,
                    known = %existing.protocol,
                    reported = %descriptor.protocol,
                    "Ignoring rediscovery over a different protocol"
                );
                return false;
            }
            existing.merge_descriptor(descriptor);
            return false;
        }

        let event = GridEvent::DeviceDiscovered {
            device_id: descriptor.id.clone(),
            device_type: descriptor.device_type,
            protocol: descriptor.protocol,
        };
        tracing::info!(
            category = "registry",
            device_id = %descriptor.id,
            protocol = %descriptor.protocol,
            address = %descriptor.address,
            "Device discovered"
        );
        devices.insert(descriptor.id.clone(), Device::from_descriptor(descriptor));
        drop(devices);

        self.bus.publish(event, EVENT_SOURCE);
        true
    }

    /// Register a configured device, optionally marked essential.
    pub async fn register_static(&self, descriptor: DeviceDescriptor, essential: bool) {
        let id = descriptor.id.clone();
        self.upsert(descriptor).await;
        if essential {
            // upsert just inserted or refreshed this id
            let _ = self.set_essential(&id, true).await;
        }
    }

    pub async fn set_essential(&self, device_id: &str, essential: bool) -> Result<()> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| Error::NotFound(device_id.to_string()))?;
        device.essential = essential;
        Ok(())
    }

    /// Run every adapter's discovery and merge the results.
    pub async fn discover(&self, adapters: &AdapterSet) -> DiscoveryReport {
        let report = discover_all(adapters).await;
        let mut added = 0usize;
        for descriptor in &report.devices {
            if self.upsert(descriptor.clone()).await {
                added += 1;
            }
        }
        tracing::info!(
            category = "discovery",
            found = report.devices.len(),
            added,
            failed_adapters = report.errors.len(),
            duration_ms = report.duration.as_millis() as u64,
            "Discovery pass finished"
        );
        report
    }

    /// All devices, sorted by id.
    pub async fn list_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub async fn get_device(&self, device_id: &str) -> Option<Device> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn get_device_state(&self, device_id: &str) -> Option<DeviceState> {
        self.devices.read().await.get(device_id).map(Device::state)
    }

    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Force a device offline.
    pub async fn mark_offline(&self, device_id: &str, reason: &str) -> Result<()> {
        let changed = {
            let mut devices = self.devices.write().await;
            let device = devices
                .get_mut(device_id)
                .ok_or_else(|| Error::NotFound(device_id.to_string()))?;
            device.last_error = Some(reason.to_string());
            let changed = device.status != DeviceStatus::Offline;
            device.status = DeviceStatus::Offline;
            changed
        };
        if changed {
            self.announce_offline(device_id, reason);
        }
        Ok(())
    }

    /// Record a successful read: store the reading and bring the device online.
    pub async fn record_success(&self, device_id: &str, reading: Reading) -> Result<()> {
        let previous = {
            let mut devices = self.devices.write().await;
            let device = devices
                .get_mut(device_id)
                .ok_or_else(|| Error::NotFound(device_id.to_string()))?;
            let previous = device.status;
            device.status = DeviceStatus::Online;
            device.consecutive_failures = 0;
            device.last_error = None;
            device.last_seen = Some(reading.timestamp);
            device.last_reading = Some(reading);
            previous
        };

        if previous != DeviceStatus::Online {
            tracing::info!(category = "registry", device_id = %device_id, previous = %previous, "Device online");
            self.bus.publish(
                GridEvent::DeviceOnline {
                    device_id: device_id.to_string(),
                    previous,
                },
                EVENT_SOURCE,
            );
        }
        Ok(())
    }

    /// Record an availability failure. Returns the resulting status.
    pub async fn record_failure(&self, device_id: &str, reason: &str) -> Result<DeviceStatus> {
        let (status, went_offline) = {
            let mut devices = self.devices.write().await;
            let device = devices
                .get_mut(device_id)
                .ok_or_else(|| Error::NotFound(device_id.to_string()))?;
            device.consecutive_failures = device.consecutive_failures.saturating_add(1);
            device.last_error = Some(reason.to_string());
            let went_offline = device.status != DeviceStatus::Offline
                && device.consecutive_failures >= self.failure_threshold;
            if went_offline {
                device.status = DeviceStatus::Offline;
            }
            (device.status, went_offline)
        };

        if went_offline {
            self.announce_offline(device_id, reason);
        } else {
            tracing::debug!(device_id = %device_id, reason = %reason, "Device failure below threshold");
        }
        Ok(status)
    }

    /// Apply a successful command to the device's commanded state.
    pub async fn update_commanded<F>(&self, device_id: &str, update: F) -> Result<DeviceState>
    where
        F: FnOnce(&mut CommandedState),
    {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| Error::NotFound(device_id.to_string()))?;
        update(&mut device.commanded);
        Ok(device.state())
    }

    /// Remove a device.
    pub async fn deregister(&self, device_id: &str) -> Result<Device> {
        let removed = self
            .devices
            .write()
            .await
            .remove(device_id)
            .ok_or_else(|| Error::NotFound(device_id.to_string()))?;
        tracing::info!(category = "registry", device_id = %device_id, "Device removed");
        self.bus.publish(
            GridEvent::DeviceRemoved {
                device_id: device_id.to_string(),
            },
            EVENT_SOURCE,
        );
        Ok(removed)
    }

    fn announce_offline(&self, device_id: &str, reason: &str) {
        tracing::warn!(category = "registry", device_id = %device_id, reason = %reason, "Device offline");
        self.bus.publish(
            GridEvent::DeviceOffline {
                device_id: device_id.to_string(),
                reason: reason.to_string(),
            },
            EVENT_SOURCE,
        );
    }
}
