//! BLE Modbus polling service
//!
//! Periodically reads (and on request writes) charge controllers, DC-DC
//! chargers and battery shunts that bridge Modbus over BLE GATT, while
//! keeping each adapter within its connection budget.

pub mod admission;
pub mod bootstrap;
#[cfg(feature = "ble")]
pub mod btle;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod session;
pub mod simulator;
pub mod sink;
pub mod transport;

pub use admission::{AdapterPermit, AdmissionController};
#[cfg(feature = "ble")]
pub use btle::BtleTransport;
pub use config::AppConfig;
pub use coordinator::{backoff_delay, Coordinator, CoordinatorHandle, WriteTarget};
pub use error::{BleSrvError, Result, SessionFailure};
pub use session::{Session, SessionOutcome, SessionReport, SessionRequest, SessionState};
pub use sink::{ChannelSink, DeviceEvent, LogSink, StateSink};
pub use transport::{BleLink, BleTransport, GattProfile, TransportError};
