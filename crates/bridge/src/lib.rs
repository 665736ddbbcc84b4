//! rust-uvc-bridge
//!
//! Finds an attached USB camera, obtains access rights to it and opens it,
//! then hands the raw descriptors (vendor/product id, usbfs root, bus and
//! device number, file descriptor) to a native UVC driver.
//!
//! Access rights are requested asynchronously from the host and the calling
//! thread blocks on a one-shot latch until the result arrives.

pub mod acquire;
pub mod calibration;
pub mod config;
pub mod enumerator;
pub mod permission;
pub mod platform;
pub mod session;
pub mod test_utils;

pub use acquire::{acquire_first, acquire_with};
pub use calibration::{CalibrationTable, CameraIntrinsics};
pub use config::BridgeConfig;
pub use enumerator::DeviceEnumerator;
pub use permission::PermissionCoordinator;
pub use platform::{DeviceConnection, PermissionCallback, PermissionEvent, UsbPlatform};
pub use session::{DeviceDescriptors, DeviceSession, SessionOptions, SessionState};
