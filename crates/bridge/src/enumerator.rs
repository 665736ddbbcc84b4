//! Device enumeration with VID:PID filtering

use crate::platform::UsbPlatform;
use common::UsbDeviceRecord;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lists attached devices through the platform
pub struct DeviceEnumerator {
    platform: Arc<dyn UsbPlatform>,
    /// Device filters (VID:PID patterns)
    filters: Vec<String>,
}

impl DeviceEnumerator {
    pub fn new(platform: Arc<dyn UsbPlatform>, filters: Vec<String>) -> Self {
        Self { platform, filters }
    }

    /// Attached devices in platform order
    ///
    /// An unavailable USB subsystem yields an empty list.
    pub fn list_devices(&self) -> Vec<UsbDeviceRecord> {
        let devices = match self.platform.list_devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("USB enumeration failed: {}", e);
                return Vec::new();
            }
        };

        let total = devices.len();
        let allowed: Vec<UsbDeviceRecord> = devices
            .into_iter()
            .filter(|device| {
                let allowed = check_filter(device.vendor_id, device.product_id, &self.filters);
                if !allowed {
                    debug!("Device ignored by filter: {}", device);
                }
                allowed
            })
            .collect();

        debug!("Enumerated {} of {} devices", allowed.len(), total);
        allowed
    }
}

/// One side of a VID:PID filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPattern {
    Any,
    Exact(u16),
}

impl IdPattern {
    /// `*` or a `0x`-prefixed id of 1-4 hex digits
    pub fn parse(s: &str) -> Option<Self> {
        if s == "*" {
            return Some(Self::Any);
        }
        let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
        if hex.is_empty() || hex.len() > 4 {
            return None;
        }
        u16::from_str_radix(hex, 16).ok().map(Self::Exact)
    }

    pub fn matches(self, id: u16) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == id,
        }
    }
}

/// Split a `VID:PID` filter into its patterns
pub fn parse_filter(filter: &str) -> Option<(IdPattern, IdPattern)> {
    let (vid, pid) = filter.split_once(':')?;
    Some((IdPattern::parse(vid)?, IdPattern::parse(pid)?))
}

/// Check if a VID/PID pair is allowed by the filters
///
/// Unparseable filters match nothing.
pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    // If no filters are defined, all devices are allowed
    if filters.is_empty() {
        return true;
    }

    filters.iter().any(|filter| {
        parse_filter(filter).is_some_and(|(v, p)| v.matches(vid) && p.matches(pid))
    })
}
