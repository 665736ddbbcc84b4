//! Test utilities for rust-uvc-bridge
//!
//! Builders for device records plus a thread join helper with a deadline,
//! so a test that deadlocks fails instead of hanging the suite.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_record;
//!
//! let device = create_mock_record(4, 0x046d, 0x081b);
//! assert_eq!(device.device_name, "/dev/bus/usb/001/004");
//! ```

use crate::usb_types::{DeviceNodePath, UsbDeviceRecord};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Microsoft LifeCam HD-3000
pub const LIFECAM_VID_PID: (u16, u16) = (0x045e, 0x0779);
/// Logitech C310 HD
pub const C310_VID_PID: (u16, u16) = (0x046d, 0x081b);

/// Create a mock device record on bus 1
///
/// # Arguments
/// * `address` - Device address, also used for the node path
/// * `vendor_id` - USB Vendor ID
/// * `product_id` - USB Product ID
pub fn create_mock_record(address: u8, vendor_id: u16, product_id: u16) -> UsbDeviceRecord {
    UsbDeviceRecord {
        vendor_id,
        product_id,
        device_name: DeviceNodePath::format(1, address),
        bus_number: 1,
        address,
        class: 0xef,
        manufacturer: Some(format!("Test Manufacturer {}", address)),
        product: Some(format!("Test Camera {}", address)),
    }
}

/// Create a mock device record with an arbitrary device name
pub fn create_mock_record_named(name: &str, vendor_id: u16, product_id: u16) -> UsbDeviceRecord {
    UsbDeviceRecord {
        vendor_id,
        product_id,
        device_name: name.to_string(),
        bus_number: 0,
        address: 0,
        class: 0x00,
        manufacturer: None,
        product: None,
    }
}

/// Create `count` mock records with distinct addresses and IDs
///
/// ```
/// use common::test_utils::create_mock_record_list;
///
/// let devices = create_mock_record_list(3);
/// assert_eq!(devices.len(), 3);
/// assert_eq!(devices[2].device_name, "/dev/bus/usb/001/003");
/// ```
pub fn create_mock_record_list(count: u8) -> Vec<UsbDeviceRecord> {
    (1..=count)
        .map(|i| create_mock_record(i, 0x1000 + i as u16, 0x2000 + i as u16))
        .collect()
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Join a thread, giving up after `duration`
///
/// Panics from the joined thread are propagated.
pub fn join_with_timeout<T>(handle: JoinHandle<T>, duration: Duration) -> Result<T, TimeoutError> {
    let deadline = Instant::now() + duration;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(TimeoutError { duration });
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    match handle.join() {
        Ok(value) => Ok(value),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mock_record() {
        let device = create_mock_record(4, 0x1234, 0x5678);

        assert_eq!(device.vendor_id, 0x1234);
        assert_eq!(device.product_id, 0x5678);
        assert_eq!(device.device_name, "/dev/bus/usb/001/004");
        assert!(device.manufacturer.is_some());
    }

    #[test]
    fn test_create_mock_record_list_unique_names() {
        let devices = create_mock_record_list(10);

        assert_eq!(devices.len(), 10);
        let names: std::collections::HashSet<_> = devices.iter().map(|d| d.key()).collect();
        assert_eq!(names.len(), 10);
    }

    #[test]
    fn test_join_with_timeout_success() {
        let handle = std::thread::spawn(|| 42);
        assert_eq!(join_with_timeout(handle, DEFAULT_TEST_TIMEOUT).unwrap(), 42);
    }

    #[test]
    fn test_join_with_timeout_failure() {
        let handle = std::thread::spawn(|| std::thread::sleep(Duration::from_millis(500)));
        assert!(join_with_timeout(handle, Duration::from_millis(20)).is_err());
    }
}
