//! Device discovery: which attached HID devices have a PEQ adapter.

use crate::error::{Error, Result};
use crate::router::AdapterRegistry;
use serde::Serialize;
use tracing::{debug, info};

/// USB vendor ids of supported families.
pub mod vids {
    pub const FIIO: u16 = 0x2972;
    pub const MOONDROP: u16 = 0x2FC6;
    pub const QUDELIX: u16 = 0x0A12;
    pub const TOPPING: u16 = 0x152A;
}

/// Information about a discovered PEQ-capable device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub product: String,
    pub vid: u16,
    pub pid: u16,
    pub path: String,
    pub serial: Option<String>,
    pub interface_number: i32,
    /// Name of the adapter the device routes to.
    pub adapter: &'static str,
}

/// Manufacturer string used for routing.
///
/// Some dongles leave the manufacturer descriptor empty; for known vendor ids
/// the family name stands in.
pub fn effective_manufacturer(reported: Option<&str>, vid: u16) -> String {
    match reported.map(str::trim) {
        Some(m) if !m.is_empty() => m.to_string(),
        _ => match vid {
            vids::FIIO => "FiiO",
            vids::MOONDROP => "Moondrop",
            vids::QUDELIX => "Qudelix",
            vids::TOPPING => "Topping",
            _ => "",
        }
        .to_string(),
    }
}

/// Enumerate USB HID devices and keep those an adapter accepts.
///
/// Serial devices (JDS Labs) are not HID and are opened by path instead.
pub fn discover_devices(registry: &AdapterRegistry) -> Result<Vec<DeviceInfo>> {
    debug!("Starting HID device enumeration");
    let api = hidapi::HidApi::new().map_err(|e| Error::Hid(e.to_string()))?;

    let mut devices = Vec::new();
    for info in api.device_list() {
        let manufacturer = effective_manufacturer(info.manufacturer_string(), info.vendor_id());
        let product = info.product_string().unwrap_or_default().trim().to_string();
        let Some(adapter) = registry.resolve_adapter(&manufacturer, &product) else {
            continue;
        };

        info!(
            manufacturer = %manufacturer,
            product = %product,
            adapter = adapter.name(),
            vid = format_args!("0x{:04X}", info.vendor_id()),
            pid = format_args!("0x{:04X}", info.product_id()),
            path = %info.path().to_string_lossy(),
            "Found PEQ device"
        );
        devices.push(DeviceInfo {
            manufacturer,
            product,
            vid: info.vendor_id(),
            pid: info.product_id(),
            path: info.path().to_string_lossy().into_owned(),
            serial: info.serial_number().map(|s| s.to_string()),
            interface_number: info.interface_number(),
            adapter: adapter.name(),
        });
    }

    debug!(count = devices.len(), "Device enumeration complete");
    Ok(devices)
}
