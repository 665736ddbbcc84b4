//! In-memory platform for tests
//!
//! [`MockPlatform`] keeps a fixed device list and a set of granted device
//! names. Permission results are delivered either explicitly with
//! [`MockPlatform::respond`] or automatically after a delay on a spawned
//! thread. Every registration, request, open and close is recorded so tests
//! can check ordering.

use crate::platform::{DeviceConnection, PermissionCallback, PermissionEvent, UsbPlatform};
use common::{Error, PermissionToken, UsbDeviceRecord};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Something the platform was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Registered(PermissionToken),
    Unregistered(PermissionToken),
    Requested(String),
    Opened { device: String, fd: i32 },
    Closed { device: String, fd: i32 },
}

#[derive(Default)]
struct MockState {
    devices: Vec<UsbDeviceRecord>,
    granted: HashSet<String>,
    listeners: HashMap<PermissionToken, PermissionCallback>,
    /// Latest token per requested device
    requests: HashMap<String, PermissionToken>,
    request_counts: HashMap<String, usize>,
    auto_respond: Option<(bool, Duration)>,
    fail_enumeration: bool,
    fail_requests: bool,
    fail_open: HashSet<String>,
    next_fd: i32,
}

/// Scriptable [`UsbPlatform`]
pub struct MockPlatform {
    state: Mutex<MockState>,
    events: Arc<Mutex<Vec<MockEvent>>>,
}

impl MockPlatform {
    pub fn new(devices: Vec<UsbDeviceRecord>) -> Self {
        Self {
            state: Mutex::new(MockState {
                devices,
                next_fd: 100,
                ..Default::default()
            }),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Give the process access to `device`
    pub fn grant(&self, device: &UsbDeviceRecord) {
        lock(&self.state).granted.insert(device.device_name.clone());
    }

    /// Take access to `device` away
    pub fn revoke(&self, device: &UsbDeviceRecord) {
        lock(&self.state).granted.remove(&device.device_name);
    }

    /// Answer every future request after `delay` on a separate thread
    pub fn auto_respond(&self, granted: bool, delay: Duration) {
        lock(&self.state).auto_respond = Some((granted, delay));
    }

    /// Make enumeration fail
    pub fn fail_enumeration(&self, fail: bool) {
        lock(&self.state).fail_enumeration = fail;
    }

    /// Make permission requests fail
    pub fn fail_requests(&self, fail: bool) {
        lock(&self.state).fail_requests = fail;
    }

    /// Make opening `device` fail even with permission
    pub fn fail_open(&self, device: &UsbDeviceRecord) {
        lock(&self.state).fail_open.insert(device.device_name.clone());
    }

    /// Deliver the result of the latest request for `device` on this thread
    ///
    /// Returns false if no request was made or its listener is gone.
    pub fn respond(&self, device: &UsbDeviceRecord, granted: bool) -> bool {
        let (token, callback) = {
            let mut state = lock(&self.state);
            let Some(token) = state.requests.get(device.key()).cloned() else {
                return false;
            };
            if granted {
                state.granted.insert(device.device_name.clone());
            }
            let callback = state.listeners.get(&token).cloned();
            (token, callback)
        };

        match callback {
            Some(callback) => {
                callback(PermissionEvent {
                    token,
                    device: device.clone(),
                    granted,
                });
                true
            }
            None => false,
        }
    }

    /// Deliver an event with an arbitrary token to every listener
    pub fn deliver_forged(&self, device: &UsbDeviceRecord, token: PermissionToken, granted: bool) {
        let callbacks: Vec<PermissionCallback> =
            lock(&self.state).listeners.values().cloned().collect();
        for callback in callbacks {
            callback(PermissionEvent {
                token: token.clone(),
                device: device.clone(),
                granted,
            });
        }
    }

    /// Poll until a request for `device` was made
    pub fn wait_for_request(&self, device: &UsbDeviceRecord, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.request_count(device) > 0 {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    pub fn request_count(&self, device: &UsbDeviceRecord) -> usize {
        lock(&self.state)
            .request_counts
            .get(device.key())
            .copied()
            .unwrap_or(0)
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.state).listeners.len()
    }

    /// Everything recorded so far
    pub fn events(&self) -> Vec<MockEvent> {
        lock(&self.events).clone()
    }

    /// Only open/close events
    pub fn connection_events(&self) -> Vec<MockEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, MockEvent::Opened { .. } | MockEvent::Closed { .. }))
            .collect()
    }

    fn record(&self, event: MockEvent) {
        lock(&self.events).push(event);
    }
}

impl UsbPlatform for MockPlatform {
    fn list_devices(&self) -> common::Result<Vec<UsbDeviceRecord>> {
        let state = lock(&self.state);
        if state.fail_enumeration {
            return Err(Error::Usb("USB service unavailable".to_string()));
        }
        Ok(state.devices.clone())
    }

    fn has_permission(&self, device: &UsbDeviceRecord) -> bool {
        lock(&self.state).granted.contains(device.key())
    }

    fn register_permission_listener(&self, token: &PermissionToken, callback: PermissionCallback) {
        lock(&self.state).listeners.insert(token.clone(), callback);
        self.record(MockEvent::Registered(token.clone()));
    }

    fn unregister_permission_listener(&self, token: &PermissionToken) {
        lock(&self.state).listeners.remove(token);
        self.record(MockEvent::Unregistered(token.clone()));
    }

    fn request_permission(
        &self,
        device: &UsbDeviceRecord,
        token: &PermissionToken,
    ) -> common::Result<()> {
        let auto = {
            let mut state = lock(&self.state);
            if state.fail_requests {
                return Err(Error::Usb("permission service unavailable".to_string()));
            }
            state
                .requests
                .insert(device.device_name.clone(), token.clone());
            *state
                .request_counts
                .entry(device.device_name.clone())
                .or_default() += 1;

            let auto_respond = state.auto_respond;
            auto_respond.map(|(granted, delay)| {
                if granted {
                    state.granted.insert(device.device_name.clone());
                }
                (granted, delay, state.listeners.get(token).cloned())
            })
        };
        self.record(MockEvent::Requested(device.device_name.clone()));

        if let Some((granted, delay, Some(callback))) = auto {
            let event = PermissionEvent {
                token: token.clone(),
                device: device.clone(),
                granted,
            };
            std::thread::Builder::new()
                .name("mock-usb-callback".to_string())
                .spawn(move || {
                    std::thread::sleep(delay);
                    callback(event);
                })?;
        }

        Ok(())
    }

    fn open_device(&self, device: &UsbDeviceRecord) -> common::Result<Box<dyn DeviceConnection>> {
        let fd = {
            let mut state = lock(&self.state);
            if !state.granted.contains(device.key()) {
                return Err(Error::PermissionDenied(device.device_name.clone()));
            }
            if state.fail_open.contains(device.key()) {
                return Err(Error::Usb(format!("Failed to open {}", device.device_name)));
            }
            let fd = state.next_fd;
            state.next_fd += 1;
            fd
        };

        self.record(MockEvent::Opened {
            device: device.device_name.clone(),
            fd,
        });

        Ok(Box::new(MockConnection {
            device: device.device_name.clone(),
            fd,
            events: self.events.clone(),
        }))
    }
}

/// Connection that records its close on drop
pub struct MockConnection {
    device: String,
    fd: i32,
    events: Arc<Mutex<Vec<MockEvent>>>,
}

impl DeviceConnection for MockConnection {
    fn file_descriptor(&self) -> i32 {
        self.fd
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        lock(&self.events).push(MockEvent::Closed {
            device: self.device.clone(),
            fd: self.fd,
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
