// src/io/serial/utils.rs
//
// Shared helpers for the serial link: read-error classification and
// port descriptions for `onionlog ports`.

use serialport::{SerialPortInfo, SerialPortType};

// ============================================================================
// Types
// ============================================================================

/// Flattened view of one enumerated port
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(p: SerialPortInfo) -> Self {
        let (port_type, manufacturer, product, serial_number, vid, pid) = match p.port_type {
            SerialPortType::UsbPort(info) => (
                "USB".to_string(),
                info.manufacturer,
                info.product,
                info.serial_number,
                Some(info.vid),
                Some(info.pid),
            ),
            SerialPortType::BluetoothPort => ("Bluetooth".to_string(), None, None, None, None, None),
            SerialPortType::PciPort => ("PCI".to_string(), None, None, None, None, None),
            SerialPortType::Unknown => ("Unknown".to_string(), None, None, None, None, None),
        };
        PortInfo {
            port_name: p.port_name,
            port_type,
            manufacturer,
            product,
            serial_number,
            vid,
            pid,
        }
    }
}

impl PortInfo {
    /// One line for the port listing; USB ids in the form `[[devices]]` expects
    pub fn describe(&self) -> String {
        let mut line = format!("{:<20} {}", self.port_name, self.port_type);
        if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            line.push_str(&format!(" vendor_id=\"{:04x}\" product_id=\"{:04x}\"", vid, pid));
        }
        if let Some(product) = self.product.as_deref().or(self.manufacturer.as_deref()) {
            line.push_str(&format!(" ({})", product));
        }
        if let Some(serial) = &self.serial_number {
            line.push_str(&format!(" serial={}", serial));
        }
        line
    }
}

// ============================================================================
// Error classification
// ============================================================================

/// Read errors that only mean "nothing arrived before the timeout"
pub fn is_idle(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    #[test]
    fn test_usb_port_describes_ids() {
        let info: PortInfo = SerialPortInfo {
            port_name: "/dev/ttyUSB0".to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid: 0x0403,
                pid: 0x6001,
                serial_number: Some("A50285BI".to_string()),
                manufacturer: Some("FTDI".to_string()),
                product: Some("FT232R USB UART".to_string()),
            }),
        }
        .into();

        assert_eq!(info.vid, Some(0x0403));
        let line = info.describe();
        assert!(line.contains("vendor_id=\"0403\" product_id=\"6001\""));
        assert!(line.contains("FT232R USB UART"));
    }

    #[test]
    fn test_unknown_port_has_no_ids() {
        let info: PortInfo = SerialPortInfo {
            port_name: "/dev/ttyS0".to_string(),
            port_type: SerialPortType::Unknown,
        }
        .into();
        assert_eq!(info.port_type, "Unknown");
        assert!(!info.describe().contains("vendor_id"));
    }

    #[test]
    fn test_is_idle() {
        assert!(is_idle(std::io::ErrorKind::TimedOut));
        assert!(is_idle(std::io::ErrorKind::WouldBlock));
        assert!(!is_idle(std::io::ErrorKind::BrokenPipe));
        assert!(!is_idle(std::io::ErrorKind::NotFound));
    }
}
