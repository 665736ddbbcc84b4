//! Common utilities for rust-uvc-bridge
//!
//! This crate provides the pieces shared by the bridge library and its CLI:
//! USB device records and device node path parsing, the one-shot permission
//! latch, error handling and logging setup.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{PermissionSignal, PermissionToken, PermissionWaiter, permission_latch};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{
    DEFAULT_USBFS, DeviceNodePath, INVALID_VALUE, PermissionStatus, UsbDeviceRecord,
};
