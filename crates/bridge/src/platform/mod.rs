//! Platform USB service
//!
//! Everything the bridge needs from the host operating system goes through
//! [`UsbPlatform`]: enumerating devices, checking and requesting access
//! rights, and opening a device node to obtain a file descriptor.
//!
//! Permission requests are asynchronous. The caller registers a listener
//! under a private [`PermissionToken`], issues the request with the same
//! token, and the platform later invokes the listener exactly once on one of
//! its own threads.

#[cfg(target_os = "linux")]
pub mod linux;

use common::{PermissionToken, UsbDeviceRecord};
use std::sync::Arc;

#[cfg(target_os = "linux")]
pub use linux::{BrokerSettings, LinuxPlatform};

/// Result of a permission request, delivered to the registered listener
#[derive(Debug, Clone)]
pub struct PermissionEvent {
    /// Token the request was issued with
    pub token: PermissionToken,
    /// Device the result applies to
    pub device: UsbDeviceRecord,
    /// Whether access was granted
    pub granted: bool,
}

/// Listener invoked with permission results
///
/// Runs on a platform thread. Implementations must not call back into the
/// platform while holding locks the platform may need.
pub type PermissionCallback = Arc<dyn Fn(PermissionEvent) + Send + Sync>;

/// An open device
///
/// The descriptor stays valid until the connection is dropped.
pub trait DeviceConnection: Send {
    /// Raw file descriptor of the opened device node
    fn file_descriptor(&self) -> i32;
}

/// Host USB service
pub trait UsbPlatform: Send + Sync {
    /// Enumerate attached devices in platform order
    fn list_devices(&self) -> common::Result<Vec<UsbDeviceRecord>>;

    /// Whether this process may open the device right now
    fn has_permission(&self, device: &UsbDeviceRecord) -> bool;

    /// Route results for `token` to `callback`
    fn register_permission_listener(&self, token: &PermissionToken, callback: PermissionCallback);

    /// Stop routing results for `token`
    fn unregister_permission_listener(&self, token: &PermissionToken);

    /// Ask for access to `device`; the result arrives on the listener for `token`
    fn request_permission(
        &self,
        device: &UsbDeviceRecord,
        token: &PermissionToken,
    ) -> common::Result<()>;

    /// Open the device node
    fn open_device(&self, device: &UsbDeviceRecord) -> common::Result<Box<dyn DeviceConnection>>;
}
