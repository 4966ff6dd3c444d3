//! Device state publication
//!
//! The coordinator reports every poll and write outcome as a [`DeviceEvent`]
//! to a [`StateSink`]. Sinks must not block; the coordinator loop calls them
//! inline.

use std::collections::BTreeMap;

use ble_modbus::DecodedValue;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// Fresh values, or the last good values re-sent after a failed poll
    Updated {
        address: String,
        values: BTreeMap<String, DecodedValue>,
        timestamp: DateTime<Utc>,
        stale: bool,
    },
    /// No values have ever been read from this device
    Unavailable { address: String, reason: String },
    WriteResult {
        address: String,
        register: u16,
        value: u16,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl DeviceEvent {
    pub fn address(&self) -> &str {
        match self {
            Self::Updated { address, .. }
            | Self::Unavailable { address, .. }
            | Self::WriteResult { address, .. } => address,
        }
    }
}

pub trait StateSink: Send + Sync {
    fn publish(&self, event: DeviceEvent);
}

/// Forwards events to a channel; drops events when the receiver lags
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<DeviceEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DeviceEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl StateSink for ChannelSink {
    fn publish(&self, event: DeviceEvent) {
        if let Err(e) = self.sender.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    warn!("State sink full, dropped event for {}", event.address())
                },
                mpsc::error::TrySendError::Closed(_) => {},
            }
        }
    }
}

/// Writes events to the log as JSON
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl StateSink for LogSink {
    fn publish(&self, event: DeviceEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!("{}", json),
            Err(e) => warn!("Unserializable event for {}: {}", event.address(), e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn unavailable() -> DeviceEvent {
        DeviceEvent::Unavailable {
            address: "AA".into(),
            reason: "connect_timeout".into(),
        }
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(DeviceEvent::WriteResult {
            address: "AA".into(),
            register: 0xE004,
            value: 2,
            success: true,
            error: None,
        })
        .unwrap();
        assert_eq!(json["event"], "write_result");
        assert_eq!(json["register"], 0xE004);
        assert!(json.get("error").is_none());

        let json = serde_json::to_value(unavailable()).unwrap();
        assert_eq!(json["event"], "unavailable");
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, mut receiver) = ChannelSink::new(1);
        sink.publish(unavailable());
        sink.publish(unavailable());
        assert!(receiver.recv().await.is_some());
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    #[traced_test]
    fn test_log_sink() {
        LogSink.publish(unavailable());
        assert!(logs_contain("\"event\":\"unavailable\""));
    }
}
