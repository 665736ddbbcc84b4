//! One-shot permission latch between a platform callback thread and a waiter
//!
//! The latch is split in two halves. The [`PermissionSignal`] is handed to
//! whatever receives the platform's permission result and is consumed when it
//! fires, so a result can be delivered at most once. The [`PermissionWaiter`]
//! is consumed by the thread that wants to open the device, so at most one
//! thread observes the result. A signal sent before the waiter starts waiting
//! is kept, which rules out lost wakeups.

use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;

/// Prefix for permission event identifiers
const TOKEN_PREFIX: &str = "uvc-bridge.usb-permission";

/// Private identifier tying a permission request to its result event
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PermissionToken(String);

impl PermissionToken {
    /// Generate a fresh, unguessable token
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        let suffix: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        Self(format!("{}.{}", TOKEN_PREFIX, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PermissionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signalling half of a permission latch
#[derive(Debug)]
pub struct PermissionSignal {
    device: String,
    tx: oneshot::Sender<()>,
}

impl PermissionSignal {
    /// Device this latch belongs to
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Release the waiter
    ///
    /// Returns false if the waiter was already dropped.
    pub fn signal(self) -> bool {
        self.tx.send(()).is_ok()
    }
}

/// Waiting half of a permission latch
#[derive(Debug)]
pub struct PermissionWaiter {
    device: String,
    rx: oneshot::Receiver<()>,
}

impl PermissionWaiter {
    /// Device this latch belongs to
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Block the current thread until the latch is signalled
    ///
    /// With `timeout` set, gives up with [`crate::Error::PermissionTimeout`].
    /// If the signal half is dropped unsignalled the wait ends with
    /// [`crate::Error::PermissionCancelled`].
    ///
    /// Must not be called from within an async runtime; use
    /// [`PermissionWaiter::wait_async`] there.
    pub fn wait(self, timeout: Option<Duration>) -> crate::Result<()> {
        match timeout {
            None => {
                let device = self.device;
                self.rx
                    .blocking_recv()
                    .map_err(|_| crate::Error::PermissionCancelled(device))
            }
            Some(_) => {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()?;
                runtime.block_on(self.wait_async(timeout))
            }
        }
    }

    /// Wait for the latch from async code
    pub async fn wait_async(self, timeout: Option<Duration>) -> crate::Result<()> {
        let Self { device, rx } = self;

        let received = match timeout {
            Some(duration) => tokio::time::timeout(duration, rx)
                .await
                .map_err(|_| crate::Error::PermissionTimeout(device.clone()))?,
            None => rx.await,
        };

        received.map_err(|_| crate::Error::PermissionCancelled(device))
    }
}

/// Create a latch for the given device key
///
/// Returns (PermissionSignal for the result listener, PermissionWaiter for
/// the thread opening the device)
pub fn permission_latch(device: &str) -> (PermissionSignal, PermissionWaiter) {
    let (tx, rx) = oneshot::channel();

    (
        PermissionSignal {
            device: device.to_string(),
            tx,
        },
        PermissionWaiter {
            device: device.to_string(),
            rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_signal_before_wait_is_kept() {
        let (signal, waiter) = permission_latch("/dev/bus/usb/001/004");
        assert!(signal.signal());
        assert!(waiter.wait(None).is_ok());
    }

    #[test]
    fn test_signal_from_other_thread() {
        let (signal, waiter) = permission_latch("/dev/bus/usb/001/004");

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            signal.signal()
        });

        assert!(waiter.wait(Some(Duration::from_secs(5))).is_ok());
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_timeout() {
        let (_signal, waiter) = permission_latch("/dev/bus/usb/001/004");
        let result = waiter.wait(Some(Duration::from_millis(20)));
        assert!(matches!(result, Err(Error::PermissionTimeout(ref d)) if d == "/dev/bus/usb/001/004"));
    }

    #[test]
    fn test_dropped_signal_cancels() {
        let (signal, waiter) = permission_latch("/dev/bus/usb/001/004");
        drop(signal);
        assert!(matches!(waiter.wait(None), Err(Error::PermissionCancelled(_))));
    }

    #[test]
    fn test_signal_without_waiter() {
        let (signal, waiter) = permission_latch("/dev/bus/usb/001/004");
        drop(waiter);
        assert!(!signal.signal());
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = PermissionToken::generate();
        let b = PermissionToken::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(TOKEN_PREFIX));
        assert_eq!(a.as_str().len(), TOKEN_PREFIX.len() + 1 + 32);
    }

    #[tokio::test]
    async fn test_wait_async() {
        let (signal, waiter) = permission_latch("/dev/bus/usb/001/004");
        tokio::spawn(async move {
            signal.signal();
        });
        assert!(waiter.wait_async(Some(Duration::from_secs(5))).await.is_ok());
    }
}
