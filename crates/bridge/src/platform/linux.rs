//! Linux host platform
//!
//! Enumeration goes through libusb (`rusb`). Access rights are the read/write
//! permissions on the usbfs node, checked with `access(2)`. Linux has no
//! interactive consent prompt; instead access usually appears shortly after
//! plug-in once udev rules have run. A permission request therefore hands the
//! device to a dedicated `permission-broker` thread that re-checks the node
//! until access shows up or the grant window closes, then delivers exactly
//! one result to the listener registered for the request's token.

use super::{DeviceConnection, PermissionCallback, PermissionEvent, UsbPlatform};
use async_channel::{Receiver, Sender, TryRecvError, bounded};
use common::{DeviceNodePath, Error, PermissionToken, UsbDeviceRecord};
use nix::unistd::{AccessFlags, access};
use rusb::{Context, Device, UsbContext};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Linux Foundation root hubs
const ROOT_HUB_VENDOR_ID: u16 = 0x1d6b;
const CLASS_HUB: u8 = 0x09;

type ListenerMap = Arc<Mutex<HashMap<PermissionToken, PermissionCallback>>>;

/// Timing of the permission broker
#[derive(Debug, Clone, Copy)]
pub struct BrokerSettings {
    /// How often a pending node is re-checked
    pub poll_interval: Duration,
    /// How long a request may wait for access before it is reported denied
    pub grant_window: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            grant_window: Duration::from_secs(10),
        }
    }
}

/// Commands for the broker thread
#[derive(Debug)]
enum BrokerCommand {
    Request {
        device: UsbDeviceRecord,
        token: PermissionToken,
    },
    Shutdown,
}

struct PendingGrant {
    device: UsbDeviceRecord,
    token: PermissionToken,
    deadline: Instant,
}

/// Platform backed by libusb and usbfs
pub struct LinuxPlatform {
    /// None if libusb could not be initialised
    context: Option<Context>,
    listeners: ListenerMap,
    broker_tx: Sender<BrokerCommand>,
    broker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl LinuxPlatform {
    /// Create the platform and start the permission broker thread
    pub fn new(settings: BrokerSettings) -> common::Result<Self> {
        let context = match Context::new() {
            Ok(context) => Some(context),
            Err(e) => {
                warn!("libusb unavailable, device enumeration disabled: {}", e);
                None
            }
        };

        let listeners: ListenerMap = Arc::new(Mutex::new(HashMap::new()));
        let (broker_tx, broker_rx) = bounded(64);

        let broker_listeners = listeners.clone();
        let broker_handle = std::thread::Builder::new()
            .name("permission-broker".to_string())
            .spawn(move || run_broker(broker_rx, broker_listeners, settings))?;

        Ok(Self {
            context,
            listeners,
            broker_tx,
            broker_handle: Mutex::new(Some(broker_handle)),
        })
    }

    fn record_for(&self, device: &Device<Context>) -> Result<UsbDeviceRecord, rusb::Error> {
        let descriptor = device.device_descriptor()?;
        let bus_number = device.bus_number();
        let address = device.address();

        let mut record = UsbDeviceRecord {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            device_name: DeviceNodePath::format(bus_number, address),
            bus_number,
            address,
            class: descriptor.class_code(),
            manufacturer: None,
            product: None,
        };

        // String descriptors need an open handle, only try when we have access
        if node_accessible(&record.device_name)
            && let Ok(handle) = device.open()
        {
            record.manufacturer = descriptor
                .manufacturer_string_index()
                .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
            record.product = descriptor
                .product_string_index()
                .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
        }

        Ok(record)
    }
}

impl UsbPlatform for LinuxPlatform {
    fn list_devices(&self) -> common::Result<Vec<UsbDeviceRecord>> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| Error::Usb("libusb context not available".to_string()))?;

        let devices = context
            .devices()
            .map_err(|e| Error::Usb(format!("Failed to enumerate devices: {}", e)))?;

        let mut records = Vec::new();
        for device in devices.iter() {
            match self.record_for(&device) {
                Ok(record) if record.vendor_id == ROOT_HUB_VENDOR_ID && record.class == CLASS_HUB => {
                    debug!("Skipping root hub {}", record);
                }
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "Failed to read descriptor for bus={}, addr={}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                ),
            }
        }

        debug!("Enumerated {} devices", records.len());
        Ok(records)
    }

    fn has_permission(&self, device: &UsbDeviceRecord) -> bool {
        node_accessible(&device.device_name)
    }

    fn register_permission_listener(&self, token: &PermissionToken, callback: PermissionCallback) {
        lock(&self.listeners).insert(token.clone(), callback);
    }

    fn unregister_permission_listener(&self, token: &PermissionToken) {
        lock(&self.listeners).remove(token);
    }

    fn request_permission(
        &self,
        device: &UsbDeviceRecord,
        token: &PermissionToken,
    ) -> common::Result<()> {
        self.broker_tx
            .send_blocking(BrokerCommand::Request {
                device: device.clone(),
                token: token.clone(),
            })
            .map_err(|e| Error::Channel(e.to_string()))
    }

    fn open_device(&self, device: &UsbDeviceRecord) -> common::Result<Box<dyn DeviceConnection>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device.device_name)
            .map_err(|e| match e.kind() {
                ErrorKind::PermissionDenied => Error::PermissionDenied(device.device_name.clone()),
                _ => Error::Io(e),
            })?;

        debug!("Opened {} as fd {}", device.device_name, file.as_raw_fd());
        Ok(Box::new(UsbfsConnection { file }))
    }
}

impl Drop for LinuxPlatform {
    fn drop(&mut self) {
        let _ = self.broker_tx.try_send(BrokerCommand::Shutdown);

        let handle = self
            .broker_handle
            .get_mut()
            .map(|h| h.take())
            .unwrap_or_else(|e| e.into_inner().take());
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("Permission broker thread panicked");
        }
    }
}

/// Connection holding the usbfs node open
struct UsbfsConnection {
    file: File,
}

impl DeviceConnection for UsbfsConnection {
    fn file_descriptor(&self) -> i32 {
        self.file.as_raw_fd()
    }
}

fn node_accessible(path: &str) -> bool {
    access(path, AccessFlags::R_OK | AccessFlags::W_OK).is_ok()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Broker loop
///
/// Blocks on the command queue while idle; while requests are pending it
/// drains commands without blocking and re-checks nodes every poll interval.
fn run_broker(rx: Receiver<BrokerCommand>, listeners: ListenerMap, settings: BrokerSettings) {
    info!("Permission broker started");
    let mut pending: Vec<PendingGrant> = Vec::new();

    loop {
        let command = if pending.is_empty() {
            match rx.recv_blocking() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            }
        } else {
            match rx.try_recv() {
                Ok(cmd) => Some(cmd),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Closed) => break,
            }
        };

        let idle = command.is_none();
        match command {
            Some(BrokerCommand::Request { device, token }) => {
                debug!("Permission requested for {}", device);
                pending.push(PendingGrant {
                    device,
                    token,
                    deadline: Instant::now() + settings.grant_window,
                });
            }
            Some(BrokerCommand::Shutdown) => break,
            None => {}
        }

        let now = Instant::now();
        pending.retain(|grant| {
            let granted = node_accessible(&grant.device.device_name);
            if granted || now >= grant.deadline {
                deliver(&listeners, grant, granted);
                false
            } else {
                true
            }
        });

        if idle && !pending.is_empty() {
            std::thread::sleep(settings.poll_interval);
        }
    }

    // Nobody will re-check these, release their waiters with a denial
    for grant in pending.drain(..) {
        deliver(&listeners, &grant, false);
    }
    info!("Permission broker stopped");
}

fn deliver(listeners: &ListenerMap, grant: &PendingGrant, granted: bool) {
    let callback = lock(listeners).get(&grant.token).cloned();

    match callback {
        Some(callback) => {
            info!(
                "Permission {} for {}",
                if granted { "granted" } else { "denied" },
                grant.device
            );
            callback(PermissionEvent {
                token: grant.token.clone(),
                device: grant.device.clone(),
                granted,
            });
        }
        None => debug!("No listener for permission result of {}", grant.device),
    }
}
