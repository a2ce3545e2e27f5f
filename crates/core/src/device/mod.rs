//! USB serial terminals: discovery, permission, auto-reconnect
//!
//! - `registry`: device records and the attach/detach rules
//! - `scanner`: enumeration of attached serial ports
//! - `monitor`: polling task that feeds the registry and emits events

pub mod monitor;
pub mod registry;
pub mod scanner;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::serial::DEFAULT_BAUD_RATE;

pub use monitor::DeviceMonitor;
pub use registry::DeviceRegistry;
pub use scanner::{DeviceScanner, ScannedDevice, SerialPortScanner};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Minimum time between two automatic connects, across all devices
    pub cooldown_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 5_000,
            poll_interval_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionState {
    Discovered,
    PermissionRequested,
    Permitted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDevice {
    pub id: String,
    pub port_name: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub product: Option<String>,
    pub alias: Option<String>,
    pub baud_rate: u32,
    pub permission: PermissionState,
    pub is_online: bool,
    pub auto_reconnect: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl UsbDevice {
    pub(crate) fn from_scan(scan: &ScannedDevice) -> Self {
        Self {
            id: scan.id.clone(),
            port_name: scan.port_name.clone(),
            vendor_id: scan.vendor_id,
            product_id: scan.product_id,
            product: scan.product.clone(),
            alias: None,
            baud_rate: DEFAULT_BAUD_RATE,
            permission: if scan.permitted {
                PermissionState::Permitted
            } else {
                PermissionState::Discovered
            },
            is_online: false,
            auto_reconnect: true,
            last_seen: None,
        }
    }

    pub fn is_permitted(&self) -> bool {
        self.permission == PermissionState::Permitted
    }

    /// Alias if set, otherwise the product string or port name
    pub fn display_name(&self) -> &str {
        self.alias
            .as_deref()
            .or(self.product.as_deref())
            .unwrap_or(&self.port_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceEvent {
    /// First sighting of a device
    Discovered(UsbDevice),
    Attached(String),
    Detached(String),
    /// The host should open a session on this device now
    AutoConnect(UsbDevice),
    /// The active device went away; any session on it is gone
    ActiveDeviceLost(String),
}
