//! Bridge configuration management
//!
//! ```toml
//! [bridge]
//! log_level = "info"
//!
//! [usb]
//! filters = ["0x046d:*"]
//!
//! [permission]
//! prerequest = true
//! timeout = "30s"        # "0" waits until the host answers
//! poll_interval = "250ms"
//! grant_window = "10s"
//!
//! [calibration]
//! path = "~/.config/rust-uvc-bridge/cameras.toml"
//! ```

use crate::enumerator::parse_filter;
use crate::session::SessionOptions;
use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub bridge: BridgeSettings,
    pub usb: UsbSettings,
    #[serde(default)]
    pub permission: PermissionSettings,
    #[serde(default)]
    pub calibration: CalibrationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID patterns, e.g. "0x046d:0x081b" or "0x045e:*"; empty allows all
    pub filters: Vec<String>,
}

/// Permission request handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionSettings {
    /// Request permission for every device as soon as it is enumerated
    #[serde(default = "PermissionSettings::default_prerequest")]
    pub prerequest: bool,
    /// Upper bound on a single permission wait; None waits forever
    #[serde(default = "PermissionSettings::default_timeout", with = "duration_str")]
    pub timeout: Option<Duration>,
    /// How often the broker re-checks device node access
    #[serde(
        default = "PermissionSettings::default_poll_interval",
        with = "duration_str"
    )]
    pub poll_interval: Option<Duration>,
    /// How long the broker waits for access before reporting a denial
    #[serde(
        default = "PermissionSettings::default_grant_window",
        with = "duration_str"
    )]
    pub grant_window: Option<Duration>,
}

impl Default for PermissionSettings {
    fn default() -> Self {
        Self {
            prerequest: Self::default_prerequest(),
            timeout: Self::default_timeout(),
            poll_interval: Self::default_poll_interval(),
            grant_window: Self::default_grant_window(),
        }
    }
}

impl PermissionSettings {
    fn default_prerequest() -> bool {
        true
    }

    fn default_timeout() -> Option<Duration> {
        Some(Duration::from_secs(30))
    }

    fn default_poll_interval() -> Option<Duration> {
        Some(Duration::from_millis(250))
    }

    fn default_grant_window() -> Option<Duration> {
        Some(Duration::from_secs(10))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CalibrationSettings {
    /// TOML file with extra camera calibrations; `~` is expanded
    #[serde(default)]
    pub path: Option<String>,
}

impl CalibrationSettings {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
    }
}

/// Durations written as unit-suffixed strings ("250ms", "1m30s")
///
/// A zero duration stands for "no limit" and maps to `None`.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(duration.unwrap_or(Duration::ZERO)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a sequence of `<number><unit>` groups, units `h`, `m`, `s`, `ms`
    ///
    /// A bare number counts as seconds.
    pub fn parse(s: &str) -> Result<Option<Duration>, String> {
        let s = s.trim().to_ascii_lowercase();
        if s.is_empty() {
            return Err("Empty duration".to_string());
        }
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(non_zero(Duration::from_secs(secs)));
        }

        let mut total = Duration::ZERO;
        let mut rest = s.as_str();
        while !rest.is_empty() {
            let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
            if digits == 0 {
                return Err(format!("Expected a number in duration '{}'", s));
            }
            let value: u64 = rest[..digits]
                .parse()
                .map_err(|_| format!("Number out of range in duration '{}'", s))?;
            rest = &rest[digits..];

            let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
            let part = match &rest[..unit_len] {
                "h" => value.checked_mul(3600).map(Duration::from_secs),
                "m" => value.checked_mul(60).map(Duration::from_secs),
                "s" => Some(Duration::from_secs(value)),
                "ms" => Some(Duration::from_millis(value)),
                unit => return Err(format!("Unknown unit '{}' in duration '{}'", unit, s)),
            };
            total = part
                .and_then(|part| total.checked_add(part))
                .ok_or_else(|| format!("Duration '{}' is too large", s))?;
            rest = &rest[unit_len..];
        }

        Ok(non_zero(total))
    }

    pub fn format(d: Duration) -> String {
        if d.is_zero() {
            return "0".to_string();
        }
        if d.subsec_millis() != 0 {
            return format!("{}ms", d.as_millis());
        }

        let secs = d.as_secs();
        [(secs / 3600, "h"), (secs % 3600 / 60, "m"), (secs % 60, "s")]
            .iter()
            .filter(|(value, _)| *value > 0)
            .map(|(value, unit)| format!("{}{}", value, unit))
            .collect()
    }

    fn non_zero(d: Duration) -> Option<Duration> {
        (!d.is_zero()).then_some(d)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeSettings {
                log_level: "info".to_string(),
            },
            usb: UsbSettings {
                filters: Vec::new(),
            },
            permission: PermissionSettings::default(),
            calibration: CalibrationSettings::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from `path`, or from the first standard location
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => Self::search_paths()
                .into_iter()
                .find(|p| p.is_file())
                .ok_or_else(|| anyhow!("No configuration file found"))?,
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults
    pub fn load_or_default() -> Self {
        Self::load(None).unwrap_or_else(|e| {
            tracing::warn!("{:#}, using defaults", e);
            Self::default()
        })
    }

    /// Write configuration as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Per-user configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("rust-uvc-bridge")
            .join("bridge.toml")
    }

    fn search_paths() -> [PathBuf; 2] {
        [
            Self::default_path(),
            PathBuf::from("/etc/uvc-bridge/bridge.toml"),
        ]
    }

    /// Options for a [`DeviceSession`](crate::DeviceSession)
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            filters: self.usb.filters.clone(),
            permission_timeout: self.permission.timeout,
            prerequest_permissions: self.permission.prerequest,
        }
    }

    /// Permission broker timing for the Linux platform
    #[cfg(target_os = "linux")]
    pub fn broker_settings(&self) -> crate::platform::BrokerSettings {
        let defaults = crate::platform::BrokerSettings::default();
        crate::platform::BrokerSettings {
            poll_interval: self.permission.poll_interval.unwrap_or(defaults.poll_interval),
            grant_window: self.permission.grant_window.unwrap_or(defaults.grant_window),
        }
    }

    fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.bridge.log_level.as_str()) {
            bail!(
                "Invalid log level '{}', expected one of: {}",
                self.bridge.log_level,
                LOG_LEVELS.join(", ")
            );
        }

        if let Some(bad) = self.usb.filters.iter().find(|f| parse_filter(f).is_none()) {
            bail!(
                "Invalid filter '{}', expected VID:PID with 0x-prefixed hex ids or '*' \
                 (e.g. '0x046d:0x081b' or '0x046d:*')",
                bad
            );
        }

        if self.permission.poll_interval.is_none() {
            bail!("permission.poll_interval must be greater than 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_filters(filters: &[&str]) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.usb.filters = filters.iter().map(|f| f.to_string()).collect();
        config
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.bridge.log_level, "info");
        assert!(config.usb.filters.is_empty());
        assert!(config.permission.prerequest);
        assert_eq!(config.permission.timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.permission.poll_interval, Some(Duration::from_millis(250)));
        assert!(config.calibration.path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_filter_validation() {
        for good in ["0x1234:0x5678", "0x1234:*", "*:0x5678", "*:*", "0xABCD:0xEF01"] {
            assert!(with_filters(&[good]).validate().is_ok(), "{}", good);
        }
        for bad in [
            "1234:5678",
            "0x1234",
            "0x1234:0x5678:0x9abc",
            "0xGHIJ:0x5678",
            "0x12345:0x5678",
        ] {
            assert!(with_filters(&[bad]).validate().is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = BridgeConfig::default();
        config.bridge.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        config.bridge.log_level = "trace".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = with_filters(&["0x046d:*"]);
        config.permission.timeout = None;
        config.permission.poll_interval = Some(Duration::from_millis(1500));

        let text = toml::to_string(&config).unwrap();
        let parsed = BridgeConfig::from_toml_str(&text).unwrap();

        assert_eq!(parsed.usb.filters, config.usb.filters);
        assert_eq!(parsed.permission.timeout, None);
        assert_eq!(parsed.permission.poll_interval, Some(Duration::from_millis(1500)));
        assert_eq!(parsed.permission.grant_window, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_parse_duration() {
        use duration_str::parse;

        assert_eq!(parse("30s"), Ok(Some(Duration::from_secs(30))));
        assert_eq!(parse("1m30s"), Ok(Some(Duration::from_secs(90))));
        assert_eq!(parse("1h"), Ok(Some(Duration::from_secs(3600))));
        assert_eq!(parse("250ms"), Ok(Some(Duration::from_millis(250))));
        assert_eq!(parse("1s500ms"), Ok(Some(Duration::from_millis(1500))));
        assert_eq!(parse(" 45 "), Ok(Some(Duration::from_secs(45))));
        assert_eq!(parse("0"), Ok(None));
        assert_eq!(parse("0s"), Ok(None));
        assert!(parse("").is_err());
        assert!(parse("5d").is_err());
        assert!(parse("m").is_err());
        assert!(parse("5 days").is_err());
        assert!(parse("18446744073709551615h").is_err());
        assert!(parse("18446744073709551615m").is_err());
        assert!(parse("18446744073709551615s1s").is_err());
    }

    #[test]
    fn test_format_duration() {
        use duration_str::format;

        assert_eq!(format(Duration::ZERO), "0");
        assert_eq!(format(Duration::from_millis(250)), "250ms");
        assert_eq!(format(Duration::from_secs(90)), "1m30s");
        assert_eq!(format(Duration::from_secs(3600)), "1h");
    }

    #[test]
    fn test_session_options() {
        let config = BridgeConfig::from_toml_str(
            r#"
[bridge]
log_level = "debug"

[usb]
filters = ["0x046d:*"]

[permission]
prerequest = false
timeout = "5s"
"#,
        )
        .unwrap();

        let options = config.session_options();
        assert_eq!(options.filters, vec!["0x046d:*".to_string()]);
        assert_eq!(options.permission_timeout, Some(Duration::from_secs(5)));
        assert!(!options.prerequest_permissions);
    }
}
