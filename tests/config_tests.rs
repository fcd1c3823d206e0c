use pvbridge::config::*;
use std::io::Write;
use tempfile::{tempdir, NamedTempFile};

const FULL: &str = r#"
[device]
instance = 41
serial = "3009876543"
custom_name = "Barn"
position = 1

[broker]
host = "mqtt.local"
port = 1884
keepalive_secs = 30
client_id = "barn-bridge"
topic_filter = "sma2/3009876543/#"

[bridge]
publish_period_ms = 500
sign_of_life_minutes = 10

[bus]
enabled = false
listen = "0.0.0.0:7171"

[logging]
directory = "/var/log/pvbridge"
level = "debug"
"#;

#[test]
fn test_load_full_config_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(FULL.as_bytes()).unwrap();

    let config = BridgeConfig::load(file.path()).unwrap();
    assert_eq!(config.device.instance, 41);
    assert_eq!(config.device.position, 1);
    assert_eq!(config.broker.port, 1884);
    assert_eq!(config.broker.client_id(41), "barn-bridge");
    assert_eq!(config.broker.topic_filter, "sma2/3009876543/#");
    assert_eq!(config.broker.topic_suffix, DEFAULT_TOPIC_SUFFIX);
    assert_eq!(config.bridge.publish_period_ms(), 500);
    assert_eq!(config.bridge.sign_of_life_ms(), Some(600_000));
    assert!(!config.bus.enabled);
    assert_eq!(config.bus.listen, "0.0.0.0:7171");
    assert_eq!(config.logging.level, "debug");
    assert_eq!(
        config.logging.directory_for(file.path()),
        std::path::PathBuf::from("/var/log/pvbridge")
    );
}

#[test]
fn test_log_directory_defaults_next_to_config() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(DEFAULT_CONFIG_FILE);
    let raw = FULL.replace("directory = \"/var/log/pvbridge\"\n", "");
    std::fs::write(&path, raw).unwrap();

    let config = BridgeConfig::load(&path).unwrap();
    assert_eq!(config.logging.directory_for(&path), dir.path());
}

#[test]
fn test_missing_file_reports_path() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    match BridgeConfig::load(&path) {
        Err(ConfigError::Read { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("expected read error, got {:?}", other),
    }
}

#[test]
fn test_malformed_toml_rejected() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[device\ninstance = ").unwrap();

    assert!(matches!(
        BridgeConfig::load(file.path()),
        Err(ConfigError::Parse { .. })
    ));
}

#[test]
fn test_empty_topic_suffix_rejected() {
    let raw = FULL.replace("topic_filter = \"sma2/3009876543/#\"", "topic_suffix = \"\"");
    assert!(matches!(
        BridgeConfig::from_toml_str(&raw),
        Err(ConfigError::Invalid(_))
    ));
}
