//! Serial port discovery
//!
//! Enumerates host serial ports, keeps the CH34x adapters and detects
//! hotplug changes by comparing successive listings.

use serialport::{SerialPortInfo, SerialPortType};

use super::{LinkError, CH34X_PRODUCT_IDS, CH34X_VENDOR_ID};

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Port without USB identification
    pub fn unidentified(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    /// USB port with the given identifiers
    pub fn usb(name: impl Into<String>, vid: u16, pid: u16) -> Self {
        Self {
            vid: Some(vid),
            pid: Some(pid),
            ..Self::unidentified(name)
        }
    }

    /// Whether this port is a supported CH34x adapter
    pub fn is_ch34x(&self) -> bool {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => is_supported_device(vid, pid),
            _ => false,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

/// Whether a vendor/product pair is one of the supported CH34x chips
pub fn is_supported_device(vid: u16, pid: u16) -> bool {
    vid == CH34X_VENDOR_ID && CH34X_PRODUCT_IDS.contains(&pid)
}

/// Chip name for a supported product id
pub fn chip_name(pid: u16) -> Option<&'static str> {
    match pid {
        0x7523 => Some("CH340"),
        0x7522 => Some("CH340K/CH343"),
        0x5523 => Some("CH341"),
        0xE523 => Some("CH330"),
        _ => None,
    }
}

/// Helper used to sort port names so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// Source of the host's serial port inventory
pub trait PortInventory: Send {
    /// Every serial port currently present
    fn available_ports(&self) -> Result<Vec<PortInfo>, LinkError>;
}

/// Inventory backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl PortInventory for SystemPorts {
    fn available_ports(&self) -> Result<Vec<PortInfo>, LinkError> {
        Ok(serialport::available_ports()?
            .into_iter()
            .map(PortInfo::from)
            .collect())
    }
}

/// Lists CH34x adapters and notices when that list changes
pub struct DeviceEnumerator {
    inventory: Box<dyn PortInventory>,
    last_seen: Vec<String>,
}

impl DeviceEnumerator {
    /// Enumerator over the given inventory, primed with the current listing
    pub fn new(inventory: Box<dyn PortInventory>) -> Self {
        let mut enumerator = Self {
            inventory,
            last_seen: Vec::new(),
        };
        enumerator.last_seen = enumerator.list_devices().unwrap_or_default();
        enumerator
    }

    /// Enumerator over the host's ports
    pub fn system() -> Self {
        Self::new(Box::new(SystemPorts))
    }

    /// Supported adapters with their USB details
    pub fn list_device_info(&self) -> Result<Vec<PortInfo>, LinkError> {
        let mut devices: Vec<PortInfo> = self
            .inventory
            .available_ports()?
            .into_iter()
            .filter(PortInfo::is_ch34x)
            .collect();
        devices.sort_by_key(|p| port_sort_key(&p.name));
        Ok(devices)
    }

    /// Port names of the supported adapters
    pub fn list_devices(&self) -> Result<Vec<String>, LinkError> {
        Ok(self
            .list_device_info()?
            .into_iter()
            .map(|p| p.name)
            .collect())
    }

    /// Re-read the inventory; true when the device list differs from the last poll
    pub fn poll_for_changes(&mut self) -> bool {
        let current = match self.list_devices() {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("port inventory query failed: {e}");
                return false;
            }
        };
        if current == self.last_seen {
            return false;
        }
        tracing::info!(
            before = self.last_seen.len(),
            after = current.len(),
            "serial device list changed"
        );
        self.last_seen = current;
        true
    }

    /// Listing observed by the last poll
    pub fn last_seen(&self) -> &[String] {
        &self.last_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakePorts(Arc<Mutex<Vec<PortInfo>>>);

    impl FakePorts {
        fn set(&self, ports: Vec<PortInfo>) {
            *self.0.lock().unwrap() = ports;
        }
    }

    impl PortInventory for FakePorts {
        fn available_ports(&self) -> Result<Vec<PortInfo>, LinkError> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    #[test]
    fn test_port_sorting() {
        let names = vec![
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
        ];
        let mut ports: Vec<PortInfo> = names.into_iter().map(PortInfo::unidentified).collect();

        ports.sort_by_key(|p| port_sort_key(&p.name));
        let ordered: Vec<String> = ports.into_iter().map(|p| p.name).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/someport",
            ]
        );
    }

    #[test]
    fn test_device_filter() {
        for pid in CH34X_PRODUCT_IDS {
            assert!(is_supported_device(0x1a86, pid));
            assert!(chip_name(pid).is_some());
            // Same product id under any other vendor is never accepted
            assert!(!is_supported_device(0x2E8A, pid));
            assert!(!is_supported_device(0x0403, pid));
        }
        assert!(!is_supported_device(0x1a86, 0x55d4));
        assert!(!PortInfo::unidentified("/dev/ttyS0").is_ch34x());
    }

    #[test]
    fn test_list_devices_filters_inventory() {
        let fake = FakePorts::default();
        fake.set(vec![
            PortInfo::usb("/dev/ttyUSB1", 0x1a86, 0x7523),
            PortInfo::usb("/dev/ttyACM0", 0x2E8A, 0x000A),
            PortInfo::usb("/dev/ttyUSB0", 0x1a86, 0x5523),
            PortInfo::usb("/dev/ttyUSB2", 0x0403, 0x7523),
            PortInfo::unidentified("/dev/ttyS0"),
        ]);
        let enumerator = DeviceEnumerator::new(Box::new(fake));
        assert_eq!(
            enumerator.list_devices().unwrap(),
            vec!["/dev/ttyUSB0".to_string(), "/dev/ttyUSB1".to_string()]
        );
    }

    #[test]
    fn test_poll_reports_each_change_once() {
        let fake = FakePorts::default();
        let mut enumerator = DeviceEnumerator::new(Box::new(fake.clone()));
        assert!(!enumerator.poll_for_changes());

        fake.set(vec![PortInfo::usb("/dev/ttyUSB0", 0x1a86, 0x7523)]);
        assert!(enumerator.poll_for_changes());
        assert!(!enumerator.poll_for_changes());
        assert_eq!(enumerator.last_seen(), ["/dev/ttyUSB0".to_string()]);

        // A non-matching device appearing is not a change
        fake.set(vec![
            PortInfo::usb("/dev/ttyUSB0", 0x1a86, 0x7523),
            PortInfo::usb("/dev/ttyACM0", 0x2E8A, 0xA02F),
        ]);
        assert!(!enumerator.poll_for_changes());

        fake.set(Vec::new());
        assert!(enumerator.poll_for_changes());
        assert!(enumerator.last_seen().is_empty());
    }
}
