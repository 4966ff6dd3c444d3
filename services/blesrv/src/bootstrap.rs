//! Service bootstrap
//!
//! Command-line arguments, logging initialization and transport selection.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use common::logging::resolve_log_dir;
use common::LogConfig;
use errors::ServiceResult;
use tracing::{info, warn};

use crate::config::{AppConfig, DEFAULT_CONFIG_PATH};
use crate::error::{BleSrvError, Result};
use crate::simulator::{SimulatedDevice, SimulatedTransport};
use crate::transport::BleTransport;

/// Command-line arguments for blesrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "blesrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "BLE Modbus polling service",
    long_about = None
)]
pub struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short = 'c', long, env = "BLESRV_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Poll simulated devices instead of real hardware
    #[arg(long)]
    pub simulate: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}

/// Initialize logging from arguments and the loaded configuration
///
/// Log directory priority: `BLESRV_LOG_DIR`, then `logging.dir`; console
/// only when neither is set.
pub fn initialize_logging(args: &Args, config: &AppConfig) -> ServiceResult<()> {
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());

    common::init_with_config(LogConfig {
        service_name: config.service.name.clone(),
        log_dir: resolve_log_dir(config.logging.dir.as_deref()),
        level,
        enable_json: config.logging.json,
        ansi: !args.no_color,
    })
}

/// Pick the BLE backend
///
/// `--simulate` always wins. Otherwise the btleplug backend is used when the
/// `ble` feature is built in.
pub async fn create_transport(args: &Args, config: &AppConfig) -> Result<Arc<dyn BleTransport>> {
    if !args.simulate {
        return radio_transport().await;
    }

    let transport = SimulatedTransport::new();
    let registry = ble_modbus::RegisterMap::builtin();
    for device in &config.devices {
        match registry.model(&device.model) {
            Some(model) => transport.add_device(
                device.address.clone(),
                SimulatedDevice::for_model(model, device.device_address).with_drift(),
            ),
            None => warn!("{}: no simulator for model {}", device.address, device.model),
        }
    }
    info!("Simulating {} device(s)", config.devices.len());
    Ok(Arc::new(transport))
}

#[cfg(feature = "ble")]
async fn radio_transport() -> Result<Arc<dyn BleTransport>> {
    let transport = crate::btle::BtleTransport::new()
        .await
        .map_err(|e| BleSrvError::TransportUnavailable(e.to_string()))?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "ble"))]
async fn radio_transport() -> Result<Arc<dyn BleTransport>> {
    Err(BleSrvError::TransportUnavailable(
        "built without the `ble` feature, run with --simulate".to_string(),
    ))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["blesrv"]);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(args.log_level.is_none());
        assert!(!args.simulate);
    }

    #[test]
    fn test_args_flags() {
        let args = Args::parse_from([
            "blesrv",
            "--config",
            "/etc/blesrv.toml",
            "-l",
            "debug",
            "--simulate",
            "--validate",
            "--no-color",
        ]);
        assert_eq!(args.config, PathBuf::from("/etc/blesrv.toml"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.simulate && args.validate && args.no_color);
    }

    #[cfg(not(feature = "ble"))]
    #[tokio::test]
    async fn test_real_transport_unavailable() {
        let args = Args::parse_from(["blesrv"]);
        assert!(matches!(
            create_transport(&args, &AppConfig::default()).await,
            Err(BleSrvError::TransportUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_simulated_transport_has_configured_devices() {
        let args = Args::parse_from(["blesrv", "--simulate"]);
        let mut config = AppConfig::default();
        config
            .devices
            .push(DeviceConfig::new("AA:BB:CC:DD:EE:01", "controller"));

        let transport = create_transport(&args, &config).await.unwrap();
        let link = transport.connect("AA:BB:CC:DD:EE:01").await.unwrap();
        transport.disconnect(&link).await.unwrap();
        assert!(transport.connect("AA:BB:CC:DD:EE:02").await.is_err());
    }
}
