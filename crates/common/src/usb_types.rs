//! USB device records and device node path handling
//!
//! A device is identified by its platform-reported device name, which on
//! Linux (and Android) is the usbfs node path, e.g. `/dev/bus/usb/001/004`.
//! Native UVC drivers need the usbfs root plus the bus and device numbers
//! encoded in that path, so the parsing lives here next to the record.

use serde::{Deserialize, Serialize};
use std::fmt;

/// usbfs root used when the device name does not carry one
pub const DEFAULT_USBFS: &str = "/dev/bus/usb";

/// Sentinel returned by numeric accessors when no value is available
pub const INVALID_VALUE: i32 = -1;

/// USB class code for video devices (interface level on most webcams)
const CLASS_VIDEO: u8 = 0x0e;
/// Miscellaneous device class, used by composite webcams with an IAD
const CLASS_MISC: u8 = 0xef;

/// A USB device as discovered at enumeration time
///
/// Identity is immutable. Two records describe the same physical device
/// when their device names match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbDeviceRecord {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Platform device name (usbfs node path)
    pub device_name: String,
    /// Bus number as reported by the host controller
    pub bus_number: u8,
    /// Device address on the bus
    pub address: u8,
    /// USB device class
    pub class: u8,
    /// Manufacturer string (if readable)
    pub manufacturer: Option<String>,
    /// Product string (if readable)
    pub product: Option<String>,
}

impl UsbDeviceRecord {
    /// Identity key used for permission bookkeeping
    pub fn key(&self) -> &str {
        &self.device_name
    }

    /// Parsed view of the device name
    pub fn node_path(&self) -> DeviceNodePath<'_> {
        DeviceNodePath::new(&self.device_name)
    }

    /// `vvvv:pppp` in lowercase hex
    pub fn vid_pid(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id, self.product_id)
    }

    /// Whether the device class hints at a camera
    ///
    /// Most UVC cameras declare their class per interface, so this is only a
    /// hint for listings; acquisition still tries every device.
    pub fn is_video_class(&self) -> bool {
        matches!(self.class, CLASS_VIDEO | CLASS_MISC)
    }
}

impl fmt::Display for UsbDeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.device_name, self.vid_pid())
    }
}

/// Permission state of a device as seen by this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionStatus {
    /// A request is outstanding and no result has arrived yet
    Pending,
    /// The process may open the device
    Granted,
    /// The process may not open the device
    Denied,
}

impl fmt::Display for PermissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Granted => "granted",
            Self::Denied => "denied",
        };
        f.write_str(s)
    }
}

/// Borrowed view over a device name such as `/dev/bus/usb/001/004`
///
/// Malformed names never produce an error: the usbfs root falls back to
/// [`DEFAULT_USBFS`] and the numbers come back as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNodePath<'a> {
    name: &'a str,
}

impl<'a> DeviceNodePath<'a> {
    pub fn new(name: &'a str) -> Self {
        Self { name }
    }

    /// Build the canonical device name for a bus/address pair
    pub fn format(bus_number: u8, address: u8) -> String {
        format!("{}/{:03}/{:03}", DEFAULT_USBFS, bus_number, address)
    }

    /// Split on `/`, dropping trailing empty segments
    fn segments(&self) -> Option<Vec<&'a str>> {
        if self.name.is_empty() {
            return None;
        }

        let mut segments: Vec<&'a str> = self.name.split('/').collect();
        while segments.last().is_some_and(|s| s.is_empty()) {
            segments.pop();
        }
        Some(segments)
    }

    /// Everything but the last two segments
    ///
    /// `/dev/bus/usb/001/004` yields `/dev/bus/usb`.
    pub fn usbfs(&self) -> String {
        let root = match self.segments() {
            Some(segments) if segments.len() > 2 => segments[..segments.len() - 2].join("/"),
            _ => String::new(),
        };

        if root.is_empty() {
            DEFAULT_USBFS.to_string()
        } else {
            root
        }
    }

    /// Second-to-last segment as an integer
    pub fn bus_number(&self) -> Option<i32> {
        let segments = self.segments()?;
        let idx = segments.len().checked_sub(2)?;
        segments[idx].parse().ok()
    }

    /// Last segment as an integer
    pub fn device_number(&self) -> Option<i32> {
        self.segments()?.last()?.parse().ok()
    }
}
