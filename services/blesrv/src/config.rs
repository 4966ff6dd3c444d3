//! Service configuration
//!
//! Loaded from YAML/TOML/JSON with `BLESRV_`-prefixed environment overrides,
//! then validated against the built-in register maps.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use ble_modbus::{RegisterMap, DEFAULT_DEVICE_ADDRESS};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{BleSrvError, Result};

/// Environment prefix for overrides (`BLESRV_POLLING__CONNECT_ATTEMPTS=5`)
pub const ENV_PREFIX: &str = "BLESRV_";

pub const DEFAULT_CONFIG_PATH: &str = "config/blesrv.yaml";

pub const MIN_POLL_INTERVAL_SECS: u64 = 10;
pub const MAX_POLL_INTERVAL_SECS: u64 = 600;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

pub const MIN_RESPONSE_TIMEOUT_SECS: u64 = 5;
pub const MAX_RESPONSE_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_ADAPTER_ID: &str = "hci0";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default = "default_adapters")]
    pub adapters: Vec<AdapterConfig>,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when neither `RUST_LOG` nor `--log-level` is given
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily log files; console only when unset
    #[serde(default)]
    pub dir: Option<String>,

    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            json: false,
        }
    }
}

/// Polling, session and backoff parameters shared by all devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub default_interval_secs: u64,

    /// Connect attempts per session
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Wait for a complete response after each request
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,

    /// First retry delay after a failed poll; doubles per consecutive failure
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    #[serde(default = "default_backoff_cap_exponent")]
    pub backoff_cap_exponent: u32,

    /// Retry delay never exceeds `poll interval * max_backoff_factor`
    #[serde(default = "default_max_backoff_factor")]
    pub max_backoff_factor: u32,

    #[serde(default = "default_max_failures")]
    pub max_failures_before_unavailable: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: default_poll_interval_secs(),
            connect_attempts: default_connect_attempts(),
            connect_timeout_secs: default_connect_timeout_secs(),
            response_timeout_secs: default_response_timeout_secs(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_exponent: default_backoff_cap_exponent(),
            max_backoff_factor: default_max_backoff_factor(),
            max_failures_before_unavailable: default_max_failures(),
        }
    }
}

impl PollingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }
}

/// One BLE adapter (radio) and its connection budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub id: String,

    /// Maximum simultaneous connections
    #[serde(default = "default_adapter_capacity")]
    pub capacity: usize,

    /// Minimum gap between two connection starts
    #[serde(default = "default_min_spacing_secs")]
    pub min_spacing_secs: u64,
}

impl AdapterConfig {
    pub fn min_spacing(&self) -> Duration {
        Duration::from_secs(self.min_spacing_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// BLE address; identifies the device
    pub address: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Register map key (`controller`, `dcc`, `shunt`)
    pub model: String,

    /// Modbus address byte
    #[serde(default = "default_device_address")]
    pub device_address: u8,

    #[serde(default)]
    pub poll_interval_secs: Option<u64>,

    /// Offset of the first poll from service start; assigned per adapter when unset
    #[serde(default)]
    pub stagger_secs: Option<u64>,

    #[serde(default = "default_adapter_id")]
    pub adapter: String,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl DeviceConfig {
    pub fn new(address: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            model: model.into(),
            device_address: default_device_address(),
            poll_interval_secs: None,
            stagger_secs: None,
            adapter: default_adapter_id(),
            enabled: true,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }

    /// Poll interval clamped to the supported range
    pub fn poll_interval(&self, polling: &PollingConfig) -> Duration {
        let secs = self
            .poll_interval_secs
            .unwrap_or(polling.default_interval_secs)
            .clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS);
        Duration::from_secs(secs)
    }
}

// Default value functions
fn default_service_name() -> String {
    "blesrv".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_response_timeout_secs() -> u64 {
    8
}

fn default_backoff_base_secs() -> u64 {
    10
}

fn default_backoff_cap_exponent() -> u32 {
    6
}

fn default_max_backoff_factor() -> u32 {
    4
}

fn default_max_failures() -> u32 {
    3
}

fn default_adapter_capacity() -> usize {
    4
}

fn default_min_spacing_secs() -> u64 {
    10
}

fn default_adapter_id() -> String {
    DEFAULT_ADAPTER_ID.to_string()
}

fn default_adapters() -> Vec<AdapterConfig> {
    vec![AdapterConfig {
        id: default_adapter_id(),
        capacity: default_adapter_capacity(),
        min_spacing_secs: default_min_spacing_secs(),
    }]
}

fn default_device_address() -> u8 {
    DEFAULT_DEVICE_ADDRESS
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Load from file plus environment, then validate
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from file plus environment without validating
    ///
    /// Callers must run [`AppConfig::validate`] before using the result.
    pub fn read(path: &Path) -> Result<Self> {
        Ok(common::load_config(path, ENV_PREFIX)?)
    }

    /// Check references and clamp out-of-range timing values
    pub fn validate(&mut self) -> Result<()> {
        let registry = RegisterMap::builtin();

        if self.adapters.is_empty() {
            return Err(BleSrvError::ConfigError(
                "at least one adapter must be configured".to_string(),
            ));
        }

        let mut adapter_ids = HashSet::new();
        for adapter in &self.adapters {
            if adapter.capacity == 0 {
                return Err(BleSrvError::ConfigError(format!(
                    "adapter {}: capacity must be at least 1",
                    adapter.id
                )));
            }
            if !adapter_ids.insert(adapter.id.as_str()) {
                return Err(BleSrvError::ConfigError(format!(
                    "adapter {} defined twice",
                    adapter.id
                )));
            }
        }

        let polling = &mut self.polling;
        if polling.connect_attempts == 0 {
            warn!("polling.connect_attempts = 0, using 1");
            polling.connect_attempts = 1;
        }
        let clamped = polling
            .response_timeout_secs
            .clamp(MIN_RESPONSE_TIMEOUT_SECS, MAX_RESPONSE_TIMEOUT_SECS);
        if clamped != polling.response_timeout_secs {
            warn!(
                "polling.response_timeout_secs {} outside {}..={}, using {}",
                polling.response_timeout_secs,
                MIN_RESPONSE_TIMEOUT_SECS,
                MAX_RESPONSE_TIMEOUT_SECS,
                clamped
            );
            polling.response_timeout_secs = clamped;
        }
        if polling.max_backoff_factor == 0 {
            warn!("polling.max_backoff_factor = 0, using 1");
            polling.max_backoff_factor = 1;
        }
        let clamped = polling
            .default_interval_secs
            .clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS);
        if clamped != polling.default_interval_secs {
            warn!(
                "polling.default_interval_secs {} outside {}..={}, using {}",
                polling.default_interval_secs,
                MIN_POLL_INTERVAL_SECS,
                MAX_POLL_INTERVAL_SECS,
                clamped
            );
            polling.default_interval_secs = clamped;
        }

        let mut addresses = HashSet::new();
        for device in &mut self.devices {
            if registry.model(&device.model).is_none() {
                return Err(BleSrvError::UnknownModel(device.model.clone()));
            }
            if !adapter_ids.contains(device.adapter.as_str()) {
                return Err(BleSrvError::UnknownAdapter(device.adapter.clone()));
            }
            if !addresses.insert(device.address.to_ascii_uppercase()) {
                return Err(BleSrvError::DuplicateDevice(device.address.clone()));
            }
            if let Some(secs) = device.poll_interval_secs {
                let clamped = secs.clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS);
                if clamped != secs {
                    warn!(
                        "{}: poll interval {}s outside {}..={}s, using {}s",
                        device.display_name(),
                        secs,
                        MIN_POLL_INTERVAL_SECS,
                        MAX_POLL_INTERVAL_SECS,
                        clamped
                    );
                    device.poll_interval_secs = Some(clamped);
                }
            }
        }

        Ok(())
    }

    pub fn adapter(&self, id: &str) -> Option<&AdapterConfig> {
        self.adapters.iter().find(|adapter| adapter.id == id)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;
    use tracing_test::traced_test;

    const SAMPLE: &str = r#"
polling:
  connect_attempts: 2
  response_timeout_secs: 30
adapters:
  - id: hci0
    capacity: 2
    min_spacing_secs: 5
devices:
  - address: "AA:BB:CC:DD:EE:01"
    name: rover
    model: controller
    poll_interval_secs: 5
  - address: "AA:BB:CC:DD:EE:02"
    model: shunt
    stagger_secs: 20
"#;

    fn write_sample(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_and_validate() {
        let file = write_sample(SAMPLE);
        let config = AppConfig::load(file.path()).unwrap();

        assert_eq!(config.service.name, "blesrv");
        assert_eq!(config.polling.connect_attempts, 2);
        assert_eq!(config.polling.response_timeout_secs, MAX_RESPONSE_TIMEOUT_SECS);
        assert_eq!(config.adapters[0].capacity, 2);

        let rover = &config.devices[0];
        assert_eq!(rover.display_name(), "rover");
        assert_eq!(rover.device_address, 0xFF);
        assert_eq!(rover.poll_interval_secs, Some(MIN_POLL_INTERVAL_SECS));
        assert_eq!(rover.adapter, "hci0");

        let shunt = &config.devices[1];
        assert_eq!(shunt.display_name(), "AA:BB:CC:DD:EE:02");
        assert_eq!(
            shunt.poll_interval(&config.polling),
            Duration::from_secs(60)
        );
        assert_eq!(shunt.stagger_secs, Some(20));
    }

    #[test]
    #[traced_test]
    fn test_clamp_warnings_emitted_on_validate() {
        let file = write_sample(SAMPLE);
        let mut config = AppConfig::read(file.path()).unwrap();
        assert_eq!(config.polling.response_timeout_secs, 30);
        assert!(!logs_contain("outside"));

        config.polling.connect_attempts = 0;
        config.validate().unwrap();
        assert!(logs_contain("polling.connect_attempts = 0, using 1"));
        assert!(logs_contain("polling.response_timeout_secs 30 outside 5..=10, using 10"));
        assert!(logs_contain("rover: poll interval 5s outside 10..=600s, using 10s"));
    }

    #[test]
    fn test_unknown_model_rejected() {
        let file = write_sample(
            "devices:\n  - address: \"AA:BB:CC:DD:EE:01\"\n    model: inverter\n",
        );
        assert!(matches!(
            AppConfig::load(file.path()),
            Err(BleSrvError::UnknownModel(model)) if model == "inverter"
        ));
    }

    #[test]
    fn test_unknown_adapter_rejected() {
        let mut config = AppConfig {
            adapters: default_adapters(),
            devices: vec![DeviceConfig {
                adapter: "hci9".into(),
                ..DeviceConfig::new("AA:BB:CC:DD:EE:01", "controller")
            }],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BleSrvError::UnknownAdapter(_))
        ));
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let mut config = AppConfig {
            adapters: default_adapters(),
            devices: vec![
                DeviceConfig::new("aa:bb:cc:dd:ee:01", "controller"),
                DeviceConfig::new("AA:BB:CC:DD:EE:01", "dcc"),
            ],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BleSrvError::DuplicateDevice(_))
        ));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = AppConfig {
            adapters: vec![AdapterConfig {
                id: "hci0".into(),
                capacity: 0,
                min_spacing_secs: 10,
            }],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BleSrvError::ConfigError(_))));
    }

    #[test]
    fn test_poll_interval_clamped() {
        let polling = PollingConfig::default();
        let mut device = DeviceConfig::new("AA", "controller");
        device.poll_interval_secs = Some(3600);
        assert_eq!(device.poll_interval(&polling), Duration::from_secs(600));
        device.poll_interval_secs = None;
        assert_eq!(device.poll_interval(&polling), Duration::from_secs(60));
    }
}
