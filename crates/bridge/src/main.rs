//! rust-uvc-bridge CLI
//!
//! Acquires an attached USB camera and prints the values a native UVC driver
//! needs to take it over.

use anyhow::{Context, Result, anyhow, bail};
use bridge::{BridgeConfig, CalibrationTable, DeviceDescriptors, DeviceSession, UsbPlatform};
use clap::Parser;
use common::setup_logging;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "uvc-bridge")]
#[command(
    author,
    version,
    about = "UVC bridge - Acquire a USB camera for a native driver"
)]
#[command(long_about = "
Finds an attached USB camera, waits for access to its device node and opens
it, then prints the vendor/product id, usbfs root, bus and device number and
file descriptor for a native UVC driver.

EXAMPLES:
    # Acquire the first usable device
    uvc-bridge

    # List devices and their permission state
    uvc-bridge --list-devices

    # Open the device at index 2
    uvc-bridge --select 2

    # Print calibration for a Logitech C310 at 640x480
    uvc-bridge --calibration 0x046d:0x081b:640x480

CONFIGURATION:
    The bridge looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/rust-uvc-bridge/bridge.toml
    3. /etc/uvc-bridge/bridge.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Open the device at this index instead of the first usable one
    #[arg(long, value_name = "INDEX")]
    select: Option<usize>,

    /// Print calibration for VID:PID:WxH and exit
    #[arg(long, value_name = "VID:PID:WxH")]
    calibration: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        BridgeConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        BridgeConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.bridge.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("rust-uvc-bridge v{}", env!("CARGO_PKG_VERSION"));

    let calibrations = load_calibrations(&config);

    if let Some(ref query) = args.calibration {
        return calibration_mode(&calibrations, query);
    }

    let platform = create_platform(&config)?;

    if args.list_devices {
        return list_devices_mode(platform, &config);
    }

    let session = DeviceSession::new(platform, config.session_options());

    let descriptors = match args.select {
        Some(index) => {
            if !session.select_device(index) {
                bail!("Failed to open usb device at index {}", index);
            }
            session
                .descriptors()
                .ok_or_else(|| anyhow!("No open connection for usb device at index {}", index))?
        }
        None => bridge::acquire_first(&session)
            .ok_or_else(|| anyhow!("No usable usb device found"))?,
    };

    print_descriptors(&descriptors, &calibrations);
    Ok(())
}

#[cfg(target_os = "linux")]
fn create_platform(config: &BridgeConfig) -> Result<Arc<dyn UsbPlatform>> {
    let platform = bridge::platform::LinuxPlatform::new(config.broker_settings())
        .context("Failed to initialize USB platform")?;
    Ok(Arc::new(platform))
}

#[cfg(not(target_os = "linux"))]
fn create_platform(_config: &BridgeConfig) -> Result<Arc<dyn UsbPlatform>> {
    bail!("No USB platform available for this operating system")
}

/// Built-in calibrations plus the configured overrides
fn load_calibrations(config: &BridgeConfig) -> CalibrationTable {
    let mut table = CalibrationTable::with_defaults();
    if let Some(path) = config.calibration.resolved_path()
        && let Err(e) = table.load_overrides(&path)
    {
        warn!("Ignoring calibration overrides: {:#}", e);
    }
    table
}

/// List USB devices and exit
fn list_devices_mode(platform: Arc<dyn UsbPlatform>, config: &BridgeConfig) -> Result<()> {
    let enumerator = bridge::DeviceEnumerator::new(platform.clone(), config.usb.filters.clone());
    let devices = enumerator.list_devices();

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for (index, device) in devices.iter().enumerate() {
        println!(
            "  [{}] {:04x}:{:04x} - {} {}",
            index,
            device.vendor_id,
            device.product_id,
            device
                .manufacturer
                .as_deref()
                .unwrap_or("Unknown Manufacturer"),
            device.product.as_deref().unwrap_or("Unknown Product")
        );
        println!(
            "      {} Class: 0x{:02x}{} Access: {}",
            device.device_name,
            device.class,
            if device.is_video_class() { " (video)" } else { "" },
            if platform.has_permission(device) {
                "granted"
            } else {
                "none"
            }
        );
        println!();
    }

    Ok(())
}

fn calibration_mode(table: &CalibrationTable, query: &str) -> Result<()> {
    let (vid, pid, width, height) = parse_calibration_query(query)?;

    match table.lookup(vid, pid, width, height) {
        Some(intrinsics) => {
            let values: Vec<String> = intrinsics
                .to_array()
                .iter()
                .map(|v| v.to_string())
                .collect();
            println!("{}", values.join(" "));
            Ok(())
        }
        None => bail!(
            "No calibration for {:04x}:{:04x} at {}x{}",
            vid,
            pid,
            width,
            height
        ),
    }
}

/// Parse `VID:PID:WxH` with hex ids
fn parse_calibration_query(query: &str) -> Result<(u16, u16, u32, u32)> {
    let parts: Vec<&str> = query.split(':').collect();
    let [vid, pid, size] = parts.as_slice() else {
        bail!("Invalid calibration query '{}', expected VID:PID:WxH", query);
    };

    let hex = |s: &str| {
        let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
        u16::from_str_radix(digits, 16).with_context(|| format!("Invalid USB id '{}'", s))
    };

    let (width, height) = size
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("Invalid frame size '{}', expected WxH", size))?;

    Ok((
        hex(*vid)?,
        hex(*pid)?,
        width.parse().context("Invalid frame width")?,
        height.parse().context("Invalid frame height")?,
    ))
}

fn print_descriptors(descriptors: &DeviceDescriptors, calibrations: &CalibrationTable) {
    println!("vendor_id={:04x}", descriptors.vendor_id);
    println!("product_id={:04x}", descriptors.product_id);
    println!("usbfs={}", descriptors.usbfs);
    println!("bus_number={}", descriptors.bus_number);
    println!("device_number={}", descriptors.device_number);
    println!("file_descriptor={}", descriptors.file_descriptor);

    for calibration in calibrations.calibrations_for(descriptors.vendor_id, descriptors.product_id)
    {
        println!(
            "calibration {}x{}: {:?}",
            calibration.frame_size.0,
            calibration.frame_size.1,
            calibration.intrinsics.to_array()
        );
    }
}
