//! Camera calibration table
//!
//! Intrinsics for external cameras, keyed by (vendor id, product id) and
//! frame size. Built-in defaults cover two common webcams; users can add or
//! override entries from a TOML file:
//!
//! ```toml
//! [[camera]]
//! vid = "0x046D"
//! pid = "0x081B"
//!
//! [[camera.calibration]]
//! size = [640, 480]
//! principal_point = [316.0, 230.895]
//! focal_length = [817.172, 816.951]
//! distortion_coefficients = [-0.0456154, 0.368814, 0.0, 0.0, -0.899576, 0.0, 0.0, 0.0]
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Number of distortion coefficients per calibration
pub const DISTORTION_COEFFICIENTS: usize = 8;

/// Microsoft LifeCam HD-3000
const VENDOR_ID_MICROSOFT: u16 = 0x045e;
const PRODUCT_ID_LIFECAM_HD_3000_1: u16 = 0x0779;
/// At least one LifeCam HD-3000 reports this product ID instead
const PRODUCT_ID_LIFECAM_HD_3000_2: u16 = 0x0810;

/// Logitech C310 HD
const VENDOR_ID_LOGITECH: u16 = 0x046d;
const PRODUCT_ID_LOGITECH_C310_HD: u16 = 0x081b;

/// Pinhole intrinsics with radial/tangential distortion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub principal_point: [f32; 2],
    pub focal_length: [f32; 2],
    pub distortion: [f32; DISTORTION_COEFFICIENTS],
}

impl CameraIntrinsics {
    /// Flat layout handed to the driver: `[ppx, ppy, fx, fy, k0..k7]`
    pub fn to_array(&self) -> [f32; 12] {
        let mut out = [0.0; 12];
        out[..2].copy_from_slice(&self.principal_point);
        out[2..4].copy_from_slice(&self.focal_length);
        out[4..].copy_from_slice(&self.distortion);
        out
    }
}

/// Intrinsics for one frame size
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub frame_size: (u32, u32),
    pub intrinsics: CameraIntrinsics,
}

/// Calibrations per (vendor id, product id)
#[derive(Debug, Clone, Default)]
pub struct CalibrationTable {
    entries: HashMap<(u16, u16), Vec<Calibration>>,
}

impl CalibrationTable {
    /// Table without any entries
    pub fn empty() -> Self {
        Self::default()
    }

    /// Table with the built-in webcam calibrations
    pub fn with_defaults() -> Self {
        let mut table = Self::empty();

        let lifecam = Calibration {
            frame_size: (640, 480),
            intrinsics: CameraIntrinsics {
                principal_point: [318.135, 228.374],
                focal_length: [678.154, 678.17],
                distortion: [0.154576, -1.19143, 0.0, 0.0, 2.06105, 0.0, 0.0, 0.0],
            },
        };
        table.insert(VENDOR_ID_MICROSOFT, PRODUCT_ID_LIFECAM_HD_3000_1, lifecam);
        table.insert(VENDOR_ID_MICROSOFT, PRODUCT_ID_LIFECAM_HD_3000_2, lifecam);

        table.insert(
            VENDOR_ID_LOGITECH,
            PRODUCT_ID_LOGITECH_C310_HD,
            Calibration {
                frame_size: (640, 480),
                intrinsics: CameraIntrinsics {
                    principal_point: [316.0, 230.895],
                    focal_length: [817.172, 816.951],
                    distortion: [-0.0456154, 0.368814, 0.0, 0.0, -0.899576, 0.0, 0.0, 0.0],
                },
            },
        );

        table
    }

    /// Add a calibration, replacing one with the same frame size
    ///
    /// Returns true if an existing entry was overwritten.
    pub fn insert(&mut self, vendor_id: u16, product_id: u16, calibration: Calibration) -> bool {
        let list = self.entries.entry((vendor_id, product_id)).or_default();

        match list
            .iter_mut()
            .find(|existing| existing.frame_size == calibration.frame_size)
        {
            Some(existing) => {
                *existing = calibration;
                debug!(
                    "Overwrote calibration for {:04x}:{:04x} frame size {}x{}",
                    vendor_id, product_id, calibration.frame_size.0, calibration.frame_size.1
                );
                true
            }
            None => {
                list.push(calibration);
                false
            }
        }
    }

    /// Intrinsics for a device at a frame size
    pub fn lookup(
        &self,
        vendor_id: u16,
        product_id: u16,
        width: u32,
        height: u32,
    ) -> Option<CameraIntrinsics> {
        self.entries
            .get(&(vendor_id, product_id))?
            .iter()
            .find(|c| c.frame_size == (width, height))
            .map(|c| c.intrinsics)
    }

    /// Every calibration known for a device
    pub fn calibrations_for(&self, vendor_id: u16, product_id: u16) -> &[Calibration] {
        self.entries
            .get(&(vendor_id, product_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Known devices, sorted by vendor then product id
    pub fn devices(&self) -> Vec<(u16, u16)> {
        let mut keys: Vec<(u16, u16)> = self.entries.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Merge entries from TOML text
    ///
    /// Cameras without a usable vid or pid are skipped. Returns the number of
    /// calibrations merged.
    pub fn merge_toml(&mut self, content: &str) -> Result<usize> {
        let file: CalibrationFile =
            toml::from_str(content).context("Failed to parse calibration file")?;

        let mut merged = 0;
        for camera in file.camera {
            let (Some(vid), Some(pid)) = (decode_id(&camera.vid), decode_id(&camera.pid)) else {
                warn!(
                    "Skipping calibration for camera with vid={:?} pid={:?}",
                    camera.vid, camera.pid
                );
                continue;
            };

            for entry in camera.calibration {
                self.insert(vid, pid, entry.into_calibration());
                merged += 1;
            }
        }

        Ok(merged)
    }

    /// Merge entries from a TOML file
    pub fn load_overrides(&mut self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read calibration file: {}", path.display()))?;

        let merged = self
            .merge_toml(&content)
            .with_context(|| format!("Invalid calibration file: {}", path.display()))?;

        info!("Loaded {} calibration(s) from {}", merged, path.display());
        Ok(merged)
    }
}

#[derive(Debug, Deserialize)]
struct CalibrationFile {
    #[serde(default)]
    camera: Vec<CameraEntry>,
}

#[derive(Debug, Deserialize)]
struct CameraEntry {
    #[serde(default)]
    vid: String,
    #[serde(default)]
    pid: String,
    #[serde(default)]
    calibration: Vec<CalibrationEntry>,
}

/// Arrays of the wrong length read as zeros
#[derive(Debug, Deserialize)]
struct CalibrationEntry {
    #[serde(default)]
    size: Vec<u32>,
    #[serde(default)]
    principal_point: Vec<f32>,
    #[serde(default)]
    focal_length: Vec<f32>,
    #[serde(default)]
    distortion_coefficients: Vec<f32>,
}

impl CalibrationEntry {
    fn into_calibration(self) -> Calibration {
        let size: [u32; 2] = fixed(&self.size);
        Calibration {
            frame_size: (size[0], size[1]),
            intrinsics: CameraIntrinsics {
                principal_point: fixed(&self.principal_point),
                focal_length: fixed(&self.focal_length),
                distortion: fixed(&self.distortion_coefficients),
            },
        }
    }
}

fn fixed<T: Copy + Default, const N: usize>(values: &[T]) -> [T; N] {
    <[T; N]>::try_from(values).unwrap_or([T::default(); N])
}

/// Parse `0x`-prefixed hex or decimal; zero is not a valid id
fn decode_id(s: &str) -> Option<u16> {
    let s = s.trim();
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok()?,
        None => s.parse().ok()?,
    };
    (value != 0).then_some(value)
}
