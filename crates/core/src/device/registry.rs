//! Device records and the attach/detach rules
//!
//! Only an offline to online transition can auto-connect, and only for a
//! permitted device with auto-reconnect on while no device is active. All
//! devices share one cooldown window, so a flapping cable yields at most one
//! connect per window. Losing the active device is reported immediately.

use chrono::Utc;
use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use super::{DeviceEvent, PermissionState, RegistryConfig, ScannedDevice, UsbDevice};
use crate::store::{get_json, put_json, KeyValueStore};
use crate::{EcrError, Result};

const DEVICE_PREFIX: &str = "device:";

type Cooldown<C> = RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

pub struct DeviceRegistry<C: Clock = DefaultClock> {
    devices: BTreeMap<String, UsbDevice>,
    active: Option<String>,
    /// `None` when the cooldown is zero
    cooldown: Option<Cooldown<C>>,
}

impl DeviceRegistry<DefaultClock> {
    pub fn new(config: &RegistryConfig) -> Self {
        Self::with_clock(config, &DefaultClock::default())
    }
}

impl<C: Clock> DeviceRegistry<C> {
    pub fn with_clock(config: &RegistryConfig, clock: &C) -> Self {
        let cooldown = Quota::with_period(Duration::from_millis(config.cooldown_ms))
            .map(|quota| RateLimiter::direct_with_clock(quota.allow_burst(nonzero!(1u32)), clock));
        Self {
            devices: BTreeMap::new(),
            active: None,
            cooldown,
        }
    }

    pub fn devices(&self) -> impl Iterator<Item = &UsbDevice> {
        self.devices.values()
    }

    pub fn get(&self, id: &str) -> Option<&UsbDevice> {
        self.devices.get(id)
    }

    pub fn active(&self) -> Option<&UsbDevice> {
        self.active.as_deref().and_then(|id| self.devices.get(id))
    }

    /// Diff a scan against the known devices
    pub fn observe(&mut self, scan: &[ScannedDevice]) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        let seen: HashSet<&str> = scan.iter().map(|d| d.id.as_str()).collect();

        // detaches first, so a device replacing the active one can connect
        let gone: Vec<String> = self
            .devices
            .values()
            .filter(|d| d.is_online && !seen.contains(d.id.as_str()))
            .map(|d| d.id.clone())
            .collect();
        for id in gone {
            if let Some(device) = self.devices.get_mut(&id) {
                device.is_online = false;
            }
            tracing::info!("Device {} detached", id);
            events.push(DeviceEvent::Detached(id.clone()));
            if self.active.as_deref() == Some(id.as_str()) {
                tracing::warn!("Active device {} lost", id);
                self.active = None;
                events.push(DeviceEvent::ActiveDeviceLost(id));
            }
        }

        let now = Utc::now();
        for scanned in scan {
            let device = self.devices.entry(scanned.id.clone()).or_insert_with(|| {
                let device = UsbDevice::from_scan(scanned);
                tracing::info!("Discovered device {} on {}", device.id, device.port_name);
                events.push(DeviceEvent::Discovered(device.clone()));
                device
            });
            device.port_name = scanned.port_name.clone();
            device.last_seen = Some(now);
            if scanned.permitted && !device.is_permitted() {
                device.permission = PermissionState::Permitted;
            }
            if device.is_online {
                continue;
            }

            device.is_online = true;
            events.push(DeviceEvent::Attached(scanned.id.clone()));
            if let Some(event) = self.try_auto_connect(&scanned.id) {
                events.push(event);
            }
        }

        events
    }

    fn try_auto_connect(&mut self, id: &str) -> Option<DeviceEvent> {
        let device = self.devices.get(id)?;
        if !device.auto_reconnect || !device.is_permitted() || self.active.is_some() {
            return None;
        }
        if let Some(cooldown) = &self.cooldown {
            if cooldown.check().is_err() {
                tracing::debug!("Auto-connect to {} suppressed by cooldown", id);
                return None;
            }
        }

        tracing::info!("Auto-connecting to {}", id);
        self.active = Some(id.to_string());
        Some(DeviceEvent::AutoConnect(device.clone()))
    }

    fn device_mut(&mut self, id: &str) -> Result<&mut UsbDevice> {
        self.devices
            .get_mut(id)
            .ok_or_else(|| EcrError::DeviceNotFound(id.to_string()))
    }

    pub fn request_permission(&mut self, id: &str) -> Result<()> {
        let device = self.device_mut(id)?;
        if device.permission == PermissionState::Discovered {
            device.permission = PermissionState::PermissionRequested;
        }
        Ok(())
    }

    pub fn grant_permission(&mut self, id: &str) -> Result<()> {
        self.device_mut(id)?.permission = PermissionState::Permitted;
        Ok(())
    }

    pub fn set_alias(&mut self, id: &str, alias: Option<String>) -> Result<()> {
        self.device_mut(id)?.alias = alias.filter(|a| !a.trim().is_empty());
        Ok(())
    }

    pub fn set_baud_rate(&mut self, id: &str, baud_rate: u32) -> Result<()> {
        if baud_rate == 0 {
            return Err(EcrError::Config("Baud rate must be positive".into()));
        }
        self.device_mut(id)?.baud_rate = baud_rate;
        Ok(())
    }

    pub fn set_auto_reconnect(&mut self, id: &str, enabled: bool) -> Result<()> {
        self.device_mut(id)?.auto_reconnect = enabled;
        Ok(())
    }

    /// Mark the device the host has a session on; `None` after a disconnect
    /// or a failed connect
    pub fn set_active(&mut self, id: Option<&str>) -> Result<()> {
        if let Some(id) = id {
            self.device_mut(id)?;
        }
        self.active = id.map(str::to_string);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<UsbDevice> {
        let device = self
            .devices
            .remove(id)
            .ok_or_else(|| EcrError::DeviceNotFound(id.to_string()))?;
        if self.active.as_deref() == Some(id) {
            self.active = None;
        }
        Ok(device)
    }

    /// Write every device under `device:<id>` and drop keys of removed ones
    pub async fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        for device in self.devices.values() {
            put_json(store, &format!("{}{}", DEVICE_PREFIX, device.id), device).await?;
        }
        for key in store.list_keys(DEVICE_PREFIX).await? {
            if !self.devices.contains_key(&key[DEVICE_PREFIX.len()..]) {
                store.remove(&key).await?;
            }
        }
        Ok(())
    }

    /// Load saved devices; they stay offline until a scan sees them
    pub async fn load(&mut self, store: &dyn KeyValueStore) -> Result<usize> {
        let mut loaded = 0;
        for key in store.list_keys(DEVICE_PREFIX).await? {
            if let Some(mut device) = get_json::<UsbDevice>(store, &key).await? {
                device.is_online = false;
                self.devices.insert(device.id.clone(), device);
                loaded += 1;
            }
        }
        tracing::debug!("Loaded {} saved devices", loaded);
        Ok(loaded)
    }
}
