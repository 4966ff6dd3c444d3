//! Configuration loading helpers
//!
//! Files are read with figment, picking the provider from the extension, and
//! then overlaid with prefixed environment variables (`__` separates nested
//! keys, e.g. `BLESRV_POLLING__CONNECT_ATTEMPTS=5`).

use std::path::Path;

use errors::{ServiceError, ServiceResult};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::de::DeserializeOwned;
use tracing::info;

/// Build the figment for a configuration file plus environment overlay
///
/// # Arguments
/// * `path` - Configuration file; `.yaml`, `.yml`, `.toml` and `.json` are supported
/// * `env_prefix` - Environment prefix such as `"BLESRV_"`
pub fn figment_for(path: &Path, env_prefix: &str) -> ServiceResult<Figment> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| {
            ServiceError::Configuration(format!("Invalid file extension: {}", path.display()))
        })?;

    let figment = match extension {
        "json" => Figment::new().merge(Json::file(path)),
        "toml" => Figment::new().merge(Toml::file(path)),
        "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ServiceError::Configuration(format!(
                "Unsupported config format: {}",
                extension
            )))
        },
    };

    Ok(figment.merge(Env::prefixed(env_prefix).split("__")))
}

/// Load and deserialize a configuration file with environment overrides
///
/// A missing file is an error.
pub fn load_config<T>(path: &Path, env_prefix: &str) -> ServiceResult<T>
where
    T: DeserializeOwned,
{
    if !path.exists() {
        return Err(ServiceError::MissingConfig(path.display().to_string()));
    }

    let config = figment_for(path, env_prefix)?.extract().map_err(|e| {
        ServiceError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
    })?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}
