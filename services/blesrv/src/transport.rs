//! BLE transport interface
//!
//! Sessions only need a link to one peripheral, a notification stream from
//! one characteristic and writes to another. The simulator implements this
//! for tests; the `ble` feature adds a btleplug backend.

use std::fmt;

use async_trait::async_trait;
use ble_modbus::ModelProtocol;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Transport layer error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connect to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("Link {0} is not connected")]
    NotConnected(LinkId),

    #[error("Subscribe to {uuid} failed: {reason}")]
    SubscribeFailed { uuid: Uuid, reason: String },

    #[error("Write to {uuid} failed: {reason}")]
    WriteFailed { uuid: Uuid, reason: String },

    #[error("Peer disconnected")]
    Disconnected,
}

/// Opaque identifier of one open connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An open connection to one peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleLink {
    pub id: LinkId,
    pub address: String,
}

/// Minimal GATT central used by connection sessions
///
/// Implementations must tolerate `unsubscribe` and `disconnect` on a link the
/// peer already dropped.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Open a connection; callers bound this with their own timeout
    async fn connect(&self, address: &str) -> Result<BleLink, TransportError>;

    /// Start notifications; each received value arrives as one `Bytes`
    async fn subscribe(
        &self,
        link: &BleLink,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Bytes>, TransportError>;

    async fn unsubscribe(&self, link: &BleLink, characteristic: Uuid) -> Result<(), TransportError>;

    async fn write(
        &self,
        link: &BleLink,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError>;

    async fn disconnect(&self, link: &BleLink) -> Result<(), TransportError>;
}

/// Notifications buffered per subscription before the sender waits
pub const NOTIFY_QUEUE_DEPTH: usize = 64;

/// Modbus request characteristic on controllers and DC-DC chargers
pub const MODBUS_WRITE_CHAR: Uuid = Uuid::from_u128(0x0000ffd1_0000_1000_8000_00805f9b34fb);

/// Modbus response characteristic on controllers and DC-DC chargers
pub const MODBUS_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);

/// Telemetry stream characteristic on battery shunts
pub const SHUNT_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x0000c411_0000_1000_8000_00805f9b34fb);

/// Characteristics a session uses for one device model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub notify: Uuid,
    /// `None` for listen-only devices
    pub write: Option<Uuid>,
}

impl GattProfile {
    pub const MODBUS: GattProfile = GattProfile {
        notify: MODBUS_NOTIFY_CHAR,
        write: Some(MODBUS_WRITE_CHAR),
    };

    pub const SHUNT: GattProfile = GattProfile {
        notify: SHUNT_NOTIFY_CHAR,
        write: None,
    };

    pub fn for_protocol(protocol: ModelProtocol) -> Self {
        match protocol {
            ModelProtocol::Modbus => Self::MODBUS,
            ModelProtocol::ShuntTelemetry => Self::SHUNT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_uuids() {
        assert_eq!(
            MODBUS_WRITE_CHAR.to_string(),
            "0000ffd1-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            MODBUS_NOTIFY_CHAR.to_string(),
            "0000fff1-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            SHUNT_NOTIFY_CHAR.to_string(),
            "0000c411-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_profile_for_protocol() {
        assert_eq!(
            GattProfile::for_protocol(ModelProtocol::Modbus).write,
            Some(MODBUS_WRITE_CHAR)
        );
        assert_eq!(
            GattProfile::for_protocol(ModelProtocol::ShuntTelemetry),
            GattProfile::SHUNT
        );
    }
}
