use nlchat_core::link::{FlowControl, FramingMode, LinkError, Parity, SerialConfig, StopBits};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_save_and_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("link.json");

    let config = SerialConfig {
        baud_rate: 9600,
        stop_bits: StopBits::Two,
        parity: Parity::Even,
        flow_control: FlowControl::Hardware,
        auto_reconnect: true,
        reconnect_interval: Duration::from_millis(2500),
        max_reconnect_attempts: 5,
        framing: FramingMode::package("<", ">", Duration::from_millis(300)).unwrap(),
        fallback_encoding: Some("gbk".to_string()),
        ..SerialConfig::for_port("/dev/ttyUSB0")
    };
    config.save(&path).unwrap();

    let loaded = SerialConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_partial_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("link.json");
    std::fs::write(&path, r#"{ "port_name": "COM3", "baud_rate": 57600 }"#).unwrap();

    let loaded = SerialConfig::load(&path).unwrap();
    assert_eq!(loaded.port_name, "COM3");
    assert_eq!(loaded.baud_rate, 57600);
    assert_eq!(loaded.framing, FramingMode::Line);
    assert_eq!(loaded.reconnect_interval, Duration::from_millis(5000));
    assert_eq!(loaded.max_reconnect_attempts, 3);
}

#[test]
fn test_package_mode_defaults_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("link.json");
    std::fs::write(&path, r#"{ "framing": { "mode": "package", "end": "\n" } }"#).unwrap();

    let loaded = SerialConfig::load(&path).unwrap();
    assert_eq!(loaded.framing, FramingMode::package_default());
}

#[test]
fn test_load_rejects_invalid_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("link.json");

    std::fs::write(&path, r#"{ "framing": { "mode": "package", "end": "" } }"#).unwrap();
    assert!(matches!(
        SerialConfig::load(&path).unwrap_err(),
        LinkError::InvalidConfig(_)
    ));

    std::fs::write(&path, "not json").unwrap();
    assert!(matches!(
        SerialConfig::load(&path).unwrap_err(),
        LinkError::InvalidConfig(_)
    ));
}

#[test]
fn test_load_missing_file() {
    let dir = TempDir::new().unwrap();
    let err = SerialConfig::load(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, LinkError::Io(_)));
}
