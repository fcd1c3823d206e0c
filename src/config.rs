use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_TOPIC_FILTER: &str = "sma2/#";
pub const DEFAULT_TOPIC_SUFFIX: &str = "inverter";
pub const DEFAULT_PUBLISH_PERIOD_MS: u64 = 250;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 60;
pub const DEFAULT_BUS_LISTEN: &str = "127.0.0.1:7070";
const MIN_KEEPALIVE_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub device: DeviceConfig,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub bridge: TimingConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub instance: u32,
    pub serial: String,
    pub custom_name: String,
    #[serde(default = "default_product_name")]
    pub product_name: String,
    #[serde(default = "default_connection")]
    pub connection: String,
    #[serde(default)]
    pub position: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_topic_filter")]
    pub topic_filter: String,
    #[serde(default = "default_topic_suffix")]
    pub topic_suffix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_publish_period_ms")]
    pub publish_period_ms: u64,
    /// Sign-of-life log interval; 0 disables the report.
    #[serde(default)]
    pub sign_of_life_minutes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bus_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_product_name() -> String {
    "MQTT Inverter".to_string()
}

fn default_connection() -> String {
    "MQTT Inverter JSON service".to_string()
}

fn default_keepalive_secs() -> u64 {
    DEFAULT_KEEPALIVE_SECS
}

fn default_topic_filter() -> String {
    DEFAULT_TOPIC_FILTER.to_string()
}

fn default_topic_suffix() -> String {
    DEFAULT_TOPIC_SUFFIX.to_string()
}

fn default_publish_period_ms() -> u64 {
    DEFAULT_PUBLISH_PERIOD_MS
}

fn default_true() -> bool {
    true
}

fn default_bus_listen() -> String {
    DEFAULT_BUS_LISTEN.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            publish_period_ms: DEFAULT_PUBLISH_PERIOD_MS,
            sign_of_life_minutes: 0,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: DEFAULT_BUS_LISTEN.to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            level: default_log_level(),
        }
    }
}

impl BridgeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.host is empty".into()));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::Invalid("broker.port must be non-zero".into()));
        }
        if self.broker.keepalive_secs < MIN_KEEPALIVE_SECS {
            return Err(ConfigError::Invalid(format!(
                "broker.keepalive_secs must be at least {}",
                MIN_KEEPALIVE_SECS
            )));
        }
        if self.broker.topic_filter.is_empty() || self.broker.topic_suffix.is_empty() {
            return Err(ConfigError::Invalid(
                "broker.topic_filter and broker.topic_suffix must be set".into(),
            ));
        }
        if self.bridge.publish_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "bridge.publish_period_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl BrokerConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn client_id(&self, device_instance: u32) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("pvbridge-{}", device_instance))
    }
}

impl TimingConfig {
    pub fn publish_period_ms(&self) -> u64 {
        self.publish_period_ms
    }

    /// `None` when the sign-of-life report is disabled.
    pub fn sign_of_life_ms(&self) -> Option<u64> {
        match self.sign_of_life_minutes {
            0 => None,
            minutes => Some(minutes.saturating_mul(60 * 1000)),
        }
    }
}

impl LoggingConfig {
    /// Log directory, falling back to the directory holding the config file.
    pub fn directory_for(&self, config_path: &Path) -> PathBuf {
        match &self.directory {
            Some(dir) => dir.clone(),
            None => config_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [device]
        instance = 42
        serial = "3001234567"
        custom_name = "Garage roof"

        [broker]
        host = "192.168.1.10"
        port = 1883
    "#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = BridgeConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.device.instance, 42);
        assert_eq!(config.device.product_name, "MQTT Inverter");
        assert_eq!(config.broker.keepalive_secs, DEFAULT_KEEPALIVE_SECS);
        assert_eq!(config.broker.topic_filter, "sma2/#");
        assert_eq!(config.broker.topic_suffix, "inverter");
        assert_eq!(config.broker.client_id(42), "pvbridge-42");
        assert_eq!(config.bridge.publish_period_ms(), 250);
        assert_eq!(config.bridge.sign_of_life_ms(), None);
        assert!(config.bus.enabled);
    }

    #[test]
    fn test_sign_of_life_minutes_to_ms() {
        let raw = format!("{}\n[bridge]\nsign_of_life_minutes = 5\n", MINIMAL);
        let config = BridgeConfig::from_toml_str(&raw).unwrap();
        assert_eq!(config.bridge.sign_of_life_ms(), Some(300_000));
    }

    #[test]
    fn test_missing_required_section() {
        let raw = "[device]\ninstance = 1\nserial = \"x\"\ncustom_name = \"y\"\n";
        assert!(matches!(
            BridgeConfig::from_toml_str(raw),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let raw = MINIMAL.replace("port = 1883", "port = 0");
        assert!(matches!(
            BridgeConfig::from_toml_str(&raw),
            Err(ConfigError::Invalid(_))
        ));

        let raw = format!("{}\n[bridge]\npublish_period_ms = 0\n", MINIMAL);
        assert!(matches!(
            BridgeConfig::from_toml_str(&raw),
            Err(ConfigError::Invalid(_))
        ));

        let raw = MINIMAL.replace("port = 1883", "port = 1883\nkeepalive_secs = 1");
        assert!(matches!(
            BridgeConfig::from_toml_str(&raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_log_directory_fallback() {
        let logging = LoggingConfig::default();
        assert_eq!(
            logging.directory_for(Path::new("/data/pvbridge/config.toml")),
            PathBuf::from("/data/pvbridge")
        );
        assert_eq!(logging.directory_for(Path::new("config.toml")), PathBuf::from("."));
    }
}
