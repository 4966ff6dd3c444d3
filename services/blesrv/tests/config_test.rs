//! Configuration loading tests against the shipped sample file

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use blesrv::config::AppConfig;
use blesrv::BleSrvError;

fn sample_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/blesrv.yaml")
}

#[test]
fn test_sample_config_is_valid() {
    let config = AppConfig::load(&sample_path()).unwrap();

    assert_eq!(config.devices.len(), 3);
    assert_eq!(config.adapters.len(), 1);
    assert_eq!(config.adapter("hci0").unwrap().capacity, 4);

    let models: Vec<_> = config.devices.iter().map(|d| d.model.as_str()).collect();
    assert_eq!(models, vec!["controller", "dcc", "shunt"]);

    let shunt = &config.devices[2];
    assert_eq!(shunt.poll_interval(&config.polling), Duration::from_secs(30));
    assert_eq!(shunt.display_name(), "house-shunt");
}

#[test]
fn test_toml_config() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write!(
        file,
        r#"
[polling]
default_interval_secs = 5

[[adapters]]
id = "hci1"
capacity = 2

[[devices]]
address = "AA:BB:CC:DD:EE:10"
model = "dcc"
adapter = "hci1"
"#
    )
    .unwrap();

    let config = AppConfig::load(file.path()).unwrap();
    let device = &config.devices[0];
    assert_eq!(device.adapter, "hci1");
    assert_eq!(config.adapter("hci1").unwrap().min_spacing(), Duration::from_secs(10));
    // below the 10 s floor
    assert_eq!(device.poll_interval(&config.polling), Duration::from_secs(10));
}

#[test]
fn test_missing_file_is_an_error() {
    let result = AppConfig::load(&PathBuf::from("/nonexistent/blesrv.yaml"));
    assert!(matches!(result, Err(BleSrvError::ConfigError(_))));
}
