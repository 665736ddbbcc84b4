//! First-usable-device acquisition
//!
//! Walks the enumerated devices in order and keeps the first one that can be
//! selected and passes the caller's probe. The probe stands in for the native
//! driver taking over the descriptors; a failing probe moves on to the next
//! device.

use crate::session::{DeviceDescriptors, DeviceSession};
use tracing::{debug, info, warn};

/// Acquire the first device that opens
pub fn acquire_first(session: &DeviceSession) -> Option<DeviceDescriptors> {
    acquire_with(session, |_| Ok(()))
}

/// Acquire the first device that opens and passes `probe`
///
/// The session is left on the acquired device. If nothing qualifies it is
/// left without a device.
pub fn acquire_with<F>(session: &DeviceSession, mut probe: F) -> Option<DeviceDescriptors>
where
    F: FnMut(&DeviceDescriptors) -> common::Result<()>,
{
    let count = session.device_count();
    debug!("Trying {} usb device(s)", count);

    for index in 0..count {
        if !session.select_device(index) {
            continue;
        }

        let Some(descriptors) = session.descriptors() else {
            warn!("Usb device at index {} has no open connection", index);
            continue;
        };

        match probe(&descriptors) {
            Ok(()) => {
                info!("Successfully opened usb device for index {}: {}", index, descriptors);
                return Some(descriptors);
            }
            Err(e) => {
                warn!("Usb device at index {} rejected: {}", index, e);
                session.close_connection();
            }
        }
    }

    info!("No usable usb device found");
    None
}
