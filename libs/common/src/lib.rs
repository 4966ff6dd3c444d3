//! Shared building blocks for the BLE polling services
//!
//! - logging bootstrap (tracing subscriber, console plus rolling files)
//! - configuration loading (figment files plus environment overlay)
//! - shutdown signal handling

pub mod config_loader;
pub mod logging;
pub mod shutdown;

pub use config_loader::load_config;
pub use logging::{init_with_config, LogConfig};
pub use shutdown::{cancel_on_shutdown, wait_for_shutdown};
