//! Permission coordination
//!
//! Bridges the platform's asynchronous permission results to threads that
//! need to block until a device may be opened. Each request gets its own
//! private token, its own listener registration and a one-shot latch. The
//! pending map is shared with the listener callbacks behind a mutex.
//!
//! Registrations are scoped: a [`ListenerGuard`] lives in the pending entry
//! and unregisters the listener when the entry is consumed, cancelled, or the
//! coordinator is dropped.

use crate::platform::{PermissionCallback, PermissionEvent, UsbPlatform};
use common::{
    Error, PermissionSignal, PermissionStatus, PermissionToken, PermissionWaiter,
    UsbDeviceRecord, permission_latch,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

type PendingMap = Arc<Mutex<HashMap<String, PendingPermission>>>;

/// Unregisters a permission listener when dropped
pub struct ListenerGuard {
    platform: Arc<dyn UsbPlatform>,
    token: PermissionToken,
}

impl ListenerGuard {
    /// Register `callback` for `token`
    pub fn register(
        platform: Arc<dyn UsbPlatform>,
        token: PermissionToken,
        callback: PermissionCallback,
    ) -> Self {
        platform.register_permission_listener(&token, callback);
        Self { platform, token }
    }

    pub fn token(&self) -> &PermissionToken {
        &self.token
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.platform.unregister_permission_listener(&self.token);
        debug!("Unregistered permission listener {}", self.token);
    }
}

/// An outstanding permission request
struct PendingPermission {
    /// Taken by the listener when the result arrives
    signal: Option<PermissionSignal>,
    /// Taken by the single thread that waits
    waiter: Option<PermissionWaiter>,
    listener: ListenerGuard,
}

/// Coordinates permission requests and the threads waiting on them
pub struct PermissionCoordinator {
    platform: Arc<dyn UsbPlatform>,
    pending: PendingMap,
    timeout: Option<Duration>,
}

impl PermissionCoordinator {
    /// Create a coordinator
    ///
    /// `timeout` bounds every wait; `None` waits until the platform answers.
    pub fn new(platform: Arc<dyn UsbPlatform>, timeout: Option<Duration>) -> Self {
        Self {
            platform,
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Make sure this process may open `device`, blocking if a request is needed
    ///
    /// Returns the platform's permission state after the result arrived.
    /// Fails with [`Error::PermissionTimeout`] when the configured timeout
    /// elapses, [`Error::PermissionCancelled`] when the request was cancelled,
    /// and [`Error::PermissionInFlight`] when another thread is already
    /// waiting on the same device.
    pub fn ensure_permission(&self, device: &UsbDeviceRecord) -> common::Result<bool> {
        let key = device.key();

        if self.platform.has_permission(device) {
            // A pre-issued request may still be outstanding, its result is moot now
            let stale = lock(&self.pending).remove(key);
            if stale.is_some() {
                debug!("Dropping outstanding request for already permitted {}", device);
            }
            return Ok(true);
        }

        let existing = {
            let mut pending = lock(&self.pending);
            match pending.get_mut(key) {
                Some(entry) => Some(
                    entry
                        .waiter
                        .take()
                        .ok_or_else(|| Error::PermissionInFlight(key.to_string()))?,
                ),
                None => None,
            }
        };

        let waiter = match existing {
            Some(waiter) => waiter,
            None => self
                .begin_request(device, false)?
                .ok_or_else(|| Error::PermissionInFlight(key.to_string()))?,
        };

        debug!("Waiting for permission result for {}", device);
        let result = waiter.wait(self.timeout);

        // The entry is finished with either way; dropping it unregisters the listener
        let finished = lock(&self.pending).remove(key);
        drop(finished);

        match result {
            Ok(()) => {
                let granted = self.platform.has_permission(device);
                if granted {
                    info!("Permission granted for {}", device);
                } else {
                    warn!("Permission denied for {}", device);
                }
                Ok(granted)
            }
            // Dropped because another caller found the device already permitted
            Err(Error::PermissionCancelled(_)) if self.platform.has_permission(device) => Ok(true),
            Err(e) => {
                warn!("Permission wait for {} failed: {}", device, e);
                Err(e)
            }
        }
    }

    /// Issue requests up front for every device lacking permission
    ///
    /// Later [`ensure_permission`](Self::ensure_permission) calls then only
    /// wait on the outstanding request. Returns the number of requests issued.
    pub fn request_all(&self, devices: &[UsbDeviceRecord]) -> usize {
        let mut issued = 0;

        for device in devices {
            if self.platform.has_permission(device) || self.is_pending(device) {
                continue;
            }

            match self.begin_request(device, true) {
                Ok(_) => issued += 1,
                Err(e) => warn!("Failed to request permission for {}: {}", device, e),
            }
        }

        if issued > 0 {
            info!("Requested permission for {} device(s)", issued);
        }
        issued
    }

    /// Current permission state of `device`
    pub fn status(&self, device: &UsbDeviceRecord) -> PermissionStatus {
        if self.platform.has_permission(device) {
            PermissionStatus::Granted
        } else if self.is_pending(device) {
            PermissionStatus::Pending
        } else {
            PermissionStatus::Denied
        }
    }

    /// Whether a request for `device` is outstanding
    pub fn is_pending(&self, device: &UsbDeviceRecord) -> bool {
        lock(&self.pending).contains_key(device.key())
    }

    /// Number of outstanding requests
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Drop every outstanding request
    ///
    /// Threads blocked in [`ensure_permission`](Self::ensure_permission) wake
    /// up with [`Error::PermissionCancelled`].
    pub fn cancel_all(&self) {
        let drained: Vec<(String, PendingPermission)> = lock(&self.pending).drain().collect();
        if !drained.is_empty() {
            info!("Cancelled {} pending permission request(s)", drained.len());
        }
    }

    /// Register a listener, record the latch, then ask the platform
    ///
    /// The entry is in place before the platform is asked, so a result that
    /// arrives immediately still finds it. Returns the waiter unless
    /// `keep_waiter` is set, in which case it stays in the entry.
    fn begin_request(
        &self,
        device: &UsbDeviceRecord,
        keep_waiter: bool,
    ) -> common::Result<Option<PermissionWaiter>> {
        let key = device.key().to_string();
        let token = PermissionToken::generate();
        let (signal, waiter) = permission_latch(&key);

        let listener = ListenerGuard::register(
            self.platform.clone(),
            token.clone(),
            result_listener(self.pending.clone()),
        );

        let (returned, raced) = {
            let mut pending = lock(&self.pending);
            match pending.get_mut(&key) {
                // Another thread issued a request for this device meanwhile
                Some(_) if keep_waiter => (None, Some(listener)),
                Some(entry) => (entry.waiter.take(), Some(listener)),
                None => {
                    let (stored, returned) = if keep_waiter {
                        (Some(waiter), None)
                    } else {
                        (None, Some(waiter))
                    };
                    pending.insert(
                        key.clone(),
                        PendingPermission {
                            signal: Some(signal),
                            waiter: stored,
                            listener,
                        },
                    );
                    (returned, None)
                }
            }
        };

        if let Some(unused) = raced {
            drop(unused);
            return Ok(returned);
        }

        info!("Requesting permission for {}", device);
        debug!("Permission request token for {}: {}", device, token);
        if let Err(e) = self.platform.request_permission(device, &token) {
            let failed = lock(&self.pending).remove(&key);
            drop(failed);
            return Err(e);
        }

        Ok(returned)
    }
}

impl Drop for PermissionCoordinator {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Listener shared by all requests of one coordinator
///
/// Only the token the entry was created with may release it.
fn result_listener(pending: PendingMap) -> PermissionCallback {
    Arc::new(move |event: PermissionEvent| {
        let mut pending = lock(&pending);
        match pending.get_mut(event.device.key()) {
            Some(entry) if entry.listener.token() == &event.token => match entry.signal.take() {
                Some(signal) => {
                    debug!(
                        "Permission result for {}: granted={}",
                        event.device, event.granted
                    );
                    signal.signal();
                }
                None => debug!("Duplicate permission result for {} ignored", event.device),
            },
            Some(_) => warn!(
                "Permission result for {} carries a foreign token, ignored",
                event.device
            ),
            None => debug!("No pending request for {}", event.device),
        }
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
