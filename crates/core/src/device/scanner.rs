//! Serial port enumeration

use serde::{Deserialize, Serialize};
use serialport::SerialPortType;

use crate::Result;

/// One port as reported by a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedDevice {
    pub id: String,
    pub port_name: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub product: Option<String>,
    /// The platform already lets us open the port
    pub permitted: bool,
}

pub trait DeviceScanner: Send + Sync {
    fn scan(&self) -> Result<Vec<ScannedDevice>>;
}

/// USB serial adapters found through `serialport::available_ports`
#[derive(Debug, Clone)]
pub struct SerialPortScanner {
    implicit_permission: bool,
}

impl SerialPortScanner {
    pub fn new() -> Self {
        Self {
            implicit_permission: true,
        }
    }

    /// Report ports as not yet permitted, so each needs an explicit grant
    pub fn require_grant(mut self) -> Self {
        self.implicit_permission = false;
        self
    }
}

impl Default for SerialPortScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceScanner for SerialPortScanner {
    fn scan(&self) -> Result<Vec<ScannedDevice>> {
        let ports = serialport::available_ports()?;
        let devices = ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                SerialPortType::UsbPort(info) => Some(ScannedDevice {
                    id: device_id(info.vid, info.pid, info.serial_number.as_deref(), &port.port_name),
                    vendor_id: Some(info.vid),
                    product_id: Some(info.pid),
                    product: info.product,
                    port_name: port.port_name,
                    permitted: self.implicit_permission,
                }),
                _ => None,
            })
            .collect::<Vec<_>>();
        tracing::trace!("Serial scan found {} USB ports", devices.len());
        Ok(devices)
    }
}

/// Stable id: the adapter serial number when present, the port name otherwise
pub fn device_id(vid: u16, pid: u16, serial_number: Option<&str>, port_name: &str) -> String {
    let suffix = serial_number.filter(|s| !s.is_empty()).unwrap_or(port_name);
    format!("{:04x}:{:04x}:{}", vid, pid, suffix)
}
