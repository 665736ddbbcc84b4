//! Integration tests for configuration and calibration files
//!
//! Run with: `cargo test -p bridge --test config_tests`

use bridge::{BridgeConfig, CalibrationTable};
use std::time::Duration;
use tempfile::TempDir;

mod bridge_config {
    use super::*;

    const MINIMAL_CONFIG: &str = r#"
[bridge]
log_level = "info"

[usb]
filters = []
"#;

    const FULL_CONFIG: &str = r#"
[bridge]
log_level = "debug"

[usb]
filters = ["0x045e:*", "0x046d:0x081b"]

[permission]
prerequest = false
timeout = "1m30s"
poll_interval = "100ms"
grant_window = "20s"

[calibration]
path = "~/cameras.toml"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = BridgeConfig::from_toml_str(MINIMAL_CONFIG).unwrap();

        assert!(config.permission.prerequest);
        assert_eq!(config.permission.timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.permission.poll_interval, Some(Duration::from_millis(250)));
        assert_eq!(config.permission.grant_window, Some(Duration::from_secs(10)));
        assert!(config.calibration.resolved_path().is_none());
    }

    #[test]
    fn test_full_config() {
        let config = BridgeConfig::from_toml_str(FULL_CONFIG).unwrap();

        assert_eq!(config.bridge.log_level, "debug");
        assert_eq!(config.usb.filters.len(), 2);
        assert!(!config.permission.prerequest);
        assert_eq!(config.permission.timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.permission.poll_interval, Some(Duration::from_millis(100)));
        assert_eq!(config.permission.grant_window, Some(Duration::from_secs(20)));

        let path = config.calibration.resolved_path().unwrap();
        assert!(path.ends_with("cameras.toml"));
        assert!(!path.starts_with("~"));
    }

    #[test]
    fn test_zero_timeout_disables() {
        let config = BridgeConfig::from_toml_str(
            r#"
[bridge]
log_level = "info"

[usb]
filters = []

[permission]
timeout = "0"
"#,
        )
        .unwrap();

        assert_eq!(config.permission.timeout, None);
        assert_eq!(config.session_options().permission_timeout, None);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let bad_level = MINIMAL_CONFIG.replace("\"info\"", "\"verbose\"");
        assert!(BridgeConfig::from_toml_str(&bad_level).is_err());

        let bad_filter = MINIMAL_CONFIG.replace("[]", "[\"046d:081b\"]");
        assert!(BridgeConfig::from_toml_str(&bad_filter).is_err());

        let bad_duration = format!("{}\n[permission]\ntimeout = \"5 days\"\n", MINIMAL_CONFIG);
        assert!(BridgeConfig::from_toml_str(&bad_duration).is_err());

        let zero_poll = format!("{}\n[permission]\npoll_interval = \"0\"\n", MINIMAL_CONFIG);
        assert!(BridgeConfig::from_toml_str(&zero_poll).is_err());

        assert!(BridgeConfig::from_toml_str("[bridge]\n").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("bridge.toml");

        let mut config = BridgeConfig::default();
        config.usb.filters = vec!["0x046d:*".to_string()];
        config.permission.timeout = Some(Duration::from_secs(45));
        config.save(&path).unwrap();

        let loaded = BridgeConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.usb.filters, config.usb.filters);
        assert_eq!(loaded.permission.timeout, Some(Duration::from_secs(45)));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(BridgeConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_broker_settings() {
        let config = BridgeConfig::from_toml_str(FULL_CONFIG).unwrap();
        let settings = config.broker_settings();

        assert_eq!(settings.poll_interval, Duration::from_millis(100));
        assert_eq!(settings.grant_window, Duration::from_secs(20));
    }
}

mod calibration_file {
    use super::*;

    #[test]
    fn test_load_overrides_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cameras.toml");
        std::fs::write(
            &path,
            r#"
[[camera]]
vid = "0x045E"
pid = "0x0779"

[[camera.calibration]]
size = [1280, 720]
principal_point = [640.0, 360.0]
focal_length = [1000.0, 1000.0]
distortion_coefficients = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
"#,
        )
        .unwrap();

        let mut table = CalibrationTable::with_defaults();
        assert_eq!(table.load_overrides(&path).unwrap(), 1);

        // Appended next to the built-in 640x480 entry
        assert_eq!(table.calibrations_for(0x045e, 0x0779).len(), 2);
        assert!(table.lookup(0x045e, 0x0779, 640, 480).is_some());
        assert_eq!(
            table.lookup(0x045e, 0x0779, 1280, 720).unwrap().to_array()[..4],
            [640.0, 360.0, 1000.0, 1000.0]
        );
        // The second LifeCam id is unaffected
        assert!(table.lookup(0x045e, 0x0810, 1280, 720).is_none());
    }

    #[test]
    fn test_load_overrides_missing_file() {
        let dir = TempDir::new().unwrap();
        let mut table = CalibrationTable::with_defaults();

        assert!(table.load_overrides(&dir.path().join("absent.toml")).is_err());
        assert_eq!(table.devices().len(), 3);
    }
}
