//! Device session
//!
//! Holds the device list from the last enumeration, the currently selected
//! device and its open connection. At most one device is active: selecting
//! another one closes the previous connection before anything else happens.
//!
//! The public surface reports failures the way the native driver expects
//! them: `select_device` returns a bool, numeric accessors return
//! [`INVALID_VALUE`] and the usbfs accessor returns `None` when no device is
//! active.

use crate::enumerator::DeviceEnumerator;
use crate::permission::PermissionCoordinator;
use crate::platform::{DeviceConnection, UsbPlatform};
use common::{INVALID_VALUE, PermissionStatus, UsbDeviceRecord};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where a session is in its select/open cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing selected (initial and final)
    NoDevice,
    /// A selection is in progress
    Selecting,
    /// Blocked on a permission result
    PermissionPending,
    /// Permission result arrived
    PermissionResolved,
    /// Device selected and connection open
    Connected,
    /// Last selection failed (bad index, denied, or open failed)
    Rejected,
}

/// Options for building a session
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// VID:PID filters applied at enumeration
    pub filters: Vec<String>,
    /// Upper bound on each permission wait
    pub permission_timeout: Option<Duration>,
    /// Request permission for every enumerated device up front
    pub prerequest_permissions: bool,
}

/// Everything a native UVC driver needs to take over a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptors {
    pub vendor_id: u16,
    pub product_id: u16,
    /// usbfs root, e.g. `/dev/bus/usb`
    pub usbfs: String,
    pub bus_number: i32,
    pub device_number: i32,
    pub file_descriptor: i32,
}

impl fmt::Display for DeviceDescriptors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} usbfs={} bus={:03} device={:03} fd={}",
            self.vendor_id,
            self.product_id,
            self.usbfs,
            self.bus_number,
            self.device_number,
            self.file_descriptor
        )
    }
}

struct SessionInner {
    devices: Vec<UsbDeviceRecord>,
    current: Option<UsbDeviceRecord>,
    connection: Option<Box<dyn DeviceConnection>>,
}

impl SessionInner {
    fn close(&mut self) {
        self.current = None;
        if let Some(connection) = self.connection.take() {
            debug!("Closing connection fd {}", connection.file_descriptor());
            drop(connection);
        }
    }
}

/// The single active device and its connection
pub struct DeviceSession {
    platform: Arc<dyn UsbPlatform>,
    enumerator: DeviceEnumerator,
    coordinator: PermissionCoordinator,
    prerequest_permissions: bool,
    inner: Mutex<SessionInner>,
    /// Kept apart from `inner` so it stays readable during a blocking select
    state: Mutex<SessionState>,
}

impl DeviceSession {
    /// Enumerate devices and build a session over them
    pub fn new(platform: Arc<dyn UsbPlatform>, options: SessionOptions) -> Self {
        let enumerator = DeviceEnumerator::new(platform.clone(), options.filters);
        let coordinator = PermissionCoordinator::new(platform.clone(), options.permission_timeout);

        let devices = enumerator.list_devices();
        info!("Found {} usb device(s)", devices.len());
        if options.prerequest_permissions {
            coordinator.request_all(&devices);
        }

        Self {
            platform,
            enumerator,
            coordinator,
            prerequest_permissions: options.prerequest_permissions,
            inner: Mutex::new(SessionInner {
                devices,
                current: None,
                connection: None,
            }),
            state: Mutex::new(SessionState::NoDevice),
        }
    }

    /// Number of devices from the last enumeration
    pub fn device_count(&self) -> usize {
        self.lock().devices.len()
    }

    /// Devices from the last enumeration
    pub fn devices(&self) -> Vec<UsbDeviceRecord> {
        self.lock().devices.clone()
    }

    /// Permission state of a device
    pub fn permission_status(&self, device: &UsbDeviceRecord) -> PermissionStatus {
        self.coordinator.status(device)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Close the session and enumerate again
    pub fn refresh(&self) -> usize {
        let mut inner = self.lock();
        inner.close();
        self.transition(SessionState::NoDevice);

        inner.devices = self.enumerator.list_devices();
        if self.prerequest_permissions {
            self.coordinator.request_all(&inner.devices);
        }
        inner.devices.len()
    }

    /// Make the device at `index` the active one
    ///
    /// Blocks while a permission result is outstanding. An out-of-range
    /// index leaves the current session untouched.
    pub fn select_device(&self, index: usize) -> bool {
        let mut inner = self.lock();

        if index >= inner.devices.len() {
            error!("Invalid usb device index: {}", index);
            return false;
        }

        self.transition(SessionState::Selecting);
        inner.close();
        let device = inner.devices[index].clone();

        if self.coordinator.status(&device) != PermissionStatus::Granted {
            self.transition(SessionState::PermissionPending);
        }

        let granted = match self.coordinator.ensure_permission(&device) {
            Ok(granted) => granted,
            Err(e) => {
                error!("Error while awaiting permission for usb device at index {}: {}", index, e);
                false
            }
        };

        if self.state() == SessionState::PermissionPending {
            self.transition(SessionState::PermissionResolved);
        }

        if !granted {
            error!("Usb permission has been denied for usb device at index {}", index);
            self.reject();
            return false;
        }

        match self.platform.open_device(&device) {
            Ok(connection) => {
                info!(
                    "Opened usb device at index {}: {} (fd {})",
                    index,
                    device,
                    connection.file_descriptor()
                );
                inner.current = Some(device);
                inner.connection = Some(connection);
                self.transition(SessionState::Connected);
                true
            }
            Err(e) => {
                warn!("Failed to open usb device at index {}: {}", index, e);
                self.reject();
                false
            }
        }
    }

    /// Close the active connection, if any
    pub fn close_connection(&self) {
        let mut inner = self.lock();
        inner.close();
        self.transition(SessionState::NoDevice);
    }

    /// Release every outstanding permission wait
    ///
    /// Callable from any thread while `select_device` is blocked; the
    /// blocked selection returns `false` unless the platform already
    /// reports access. Later selections request permission afresh.
    pub fn cancel_pending(&self) {
        self.coordinator.cancel_all();
    }

    /// The active device
    pub fn current_device(&self) -> Option<UsbDeviceRecord> {
        self.lock().current.clone()
    }

    pub fn vendor_id(&self) -> i32 {
        self.lock()
            .current
            .as_ref()
            .map_or(INVALID_VALUE, |d| i32::from(d.vendor_id))
    }

    pub fn product_id(&self) -> i32 {
        self.lock()
            .current
            .as_ref()
            .map_or(INVALID_VALUE, |d| i32::from(d.product_id))
    }

    pub fn file_descriptor(&self) -> i32 {
        self.lock()
            .connection
            .as_ref()
            .map_or(INVALID_VALUE, |c| c.file_descriptor())
    }

    /// usbfs root of the active device
    pub fn usbfs(&self) -> Option<String> {
        self.lock().current.as_ref().map(|d| d.node_path().usbfs())
    }

    pub fn bus_number(&self) -> i32 {
        self.lock()
            .current
            .as_ref()
            .and_then(|d| d.node_path().bus_number())
            .unwrap_or(INVALID_VALUE)
    }

    pub fn device_number(&self) -> i32 {
        self.lock()
            .current
            .as_ref()
            .and_then(|d| d.node_path().device_number())
            .unwrap_or(INVALID_VALUE)
    }

    /// All hand-off values for the active device
    pub fn descriptors(&self) -> Option<DeviceDescriptors> {
        let inner = self.lock();
        let device = inner.current.as_ref()?;
        let connection = inner.connection.as_ref()?;
        let path = device.node_path();

        Some(DeviceDescriptors {
            vendor_id: device.vendor_id,
            product_id: device.product_id,
            usbfs: path.usbfs(),
            bus_number: path.bus_number().unwrap_or(INVALID_VALUE),
            device_number: path.device_number().unwrap_or(INVALID_VALUE),
            file_descriptor: connection.file_descriptor(),
        })
    }

    fn transition(&self, to: SessionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != to {
            debug!("Session state {:?} -> {:?}", *state, to);
            *state = to;
        }
    }

    fn reject(&self) {
        self.transition(SessionState::Rejected);
        self.transition(SessionState::NoDevice);
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.coordinator.cancel_all();
        self.lock().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockEvent, MockPlatform};
    use common::test_utils::{create_mock_record, create_mock_record_named};

    fn session_with(platform: &Arc<MockPlatform>) -> DeviceSession {
        DeviceSession::new(
            platform.clone(),
            SessionOptions {
                permission_timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_accessors_without_device() {
        let platform = Arc::new(MockPlatform::new(vec![]));
        let session = session_with(&platform);

        assert_eq!(session.vendor_id(), INVALID_VALUE);
        assert_eq!(session.product_id(), INVALID_VALUE);
        assert_eq!(session.file_descriptor(), INVALID_VALUE);
        assert_eq!(session.bus_number(), INVALID_VALUE);
        assert_eq!(session.device_number(), INVALID_VALUE);
        assert_eq!(session.usbfs(), None);
        assert!(session.descriptors().is_none());
        assert_eq!(session.state(), SessionState::NoDevice);
    }

    #[test]
    fn test_select_granted_device() {
        let device = create_mock_record(4, 0x046d, 0x081b);
        let platform = Arc::new(MockPlatform::new(vec![device.clone()]));
        platform.grant(&device);
        let session = session_with(&platform);

        assert!(session.select_device(0));
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.vendor_id(), 0x046d);
        assert_eq!(session.product_id(), 0x081b);
        assert_eq!(session.usbfs().as_deref(), Some("/dev/bus/usb"));
        assert_eq!(session.bus_number(), 1);
        assert_eq!(session.device_number(), 4);
        assert_eq!(session.file_descriptor(), 100);
    }

    #[test]
    fn test_malformed_name_degrades() {
        let device = create_mock_record_named("usbcam", 0x046d, 0x081b);
        let platform = Arc::new(MockPlatform::new(vec![device.clone()]));
        platform.grant(&device);
        let session = session_with(&platform);

        assert!(session.select_device(0));
        assert_eq!(session.usbfs().as_deref(), Some(common::DEFAULT_USBFS));
        assert_eq!(session.bus_number(), INVALID_VALUE);
        assert_eq!(session.device_number(), INVALID_VALUE);
        assert_ne!(session.file_descriptor(), INVALID_VALUE);
    }

    #[test]
    fn test_close_connection_twice() {
        let device = create_mock_record(4, 0x046d, 0x081b);
        let platform = Arc::new(MockPlatform::new(vec![device.clone()]));
        platform.grant(&device);
        let session = session_with(&platform);

        assert!(session.select_device(0));
        session.close_connection();
        session.close_connection();

        assert_eq!(session.file_descriptor(), INVALID_VALUE);
        assert_eq!(session.state(), SessionState::NoDevice);
        let closes = platform
            .connection_events()
            .into_iter()
            .filter(|e| matches!(e, MockEvent::Closed { .. }))
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_open_failure_rejects() {
        let device = create_mock_record(4, 0x046d, 0x081b);
        let platform = Arc::new(MockPlatform::new(vec![device.clone()]));
        platform.grant(&device);
        platform.fail_open(&device);
        let session = session_with(&platform);

        assert!(!session.select_device(0));
        assert_eq!(session.state(), SessionState::NoDevice);
        assert_eq!(session.vendor_id(), INVALID_VALUE);
    }
}
