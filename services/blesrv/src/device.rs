//! Per-device runtime state owned by the coordinator

use std::collections::BTreeMap;
use std::time::Duration;

use ble_modbus::{DecodedValue, DeviceModel};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::DeviceConfig;

#[derive(Debug)]
pub struct DeviceRuntime {
    pub config: DeviceConfig,
    pub model: &'static DeviceModel,
    pub poll_interval: Duration,
    /// Unique per registration; results of jobs started for an earlier
    /// registration of the same address are discarded
    pub registration: u64,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub values: BTreeMap<String, DecodedValue>,
    pub in_flight: bool,
    /// Drawn from a coordinator-wide counter on every reschedule; queue
    /// entries carrying any other generation are ignored
    pub generation: u64,
    /// Child of the service token; cancelled on removal
    pub cancel: CancellationToken,
    /// A refresh or write arrived while a job was running
    pub refresh_pending: bool,
}

impl DeviceRuntime {
    pub fn new(
        config: DeviceConfig,
        model: &'static DeviceModel,
        poll_interval: Duration,
        registration: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            model,
            poll_interval,
            registration,
            last_attempt: None,
            last_success: None,
            consecutive_failures: 0,
            values: BTreeMap::new(),
            in_flight: false,
            generation: 0,
            cancel,
            refresh_pending: false,
        }
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// Whether values have ever been read
    pub fn has_succeeded(&self) -> bool {
        self.last_success.is_some()
    }

    pub fn record_success(&mut self, values: BTreeMap<String, DecodedValue>, at: DateTime<Utc>) {
        self.last_success = Some(at);
        self.consecutive_failures = 0;
        self.values = values;
    }

    /// Returns the new consecutive failure count
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            address: self.config.address.clone(),
            name: self.config.display_name().to_string(),
            model: self.model.key,
            adapter: self.config.adapter.clone(),
            available: self.has_succeeded(),
            in_flight: self.in_flight,
            consecutive_failures: self.consecutive_failures,
            poll_interval: self.poll_interval,
            last_attempt: self.last_attempt,
            last_success: self.last_success,
            values: self.values.clone(),
        }
    }
}

/// Serializable view of one device for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub address: String,
    pub name: String,
    pub model: &'static str,
    pub adapter: String,
    pub available: bool,
    pub in_flight: bool,
    pub consecutive_failures: u32,
    pub poll_interval: Duration,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub values: BTreeMap<String, DecodedValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ble_modbus::models::CONTROLLER;

    #[test]
    fn test_success_resets_failures_and_replaces_values() {
        let mut device = DeviceRuntime::new(
            DeviceConfig::new("AA", "controller"),
            &CONTROLLER,
            Duration::from_secs(60),
            1,
            CancellationToken::new(),
        );
        assert!(!device.has_succeeded());
        assert_eq!(device.record_failure(), 1);
        assert_eq!(device.record_failure(), 2);

        let mut values = BTreeMap::new();
        values.insert("battery_voltage".to_string(), DecodedValue::Float(14.6));
        values.insert("charging_status".to_string(), DecodedValue::Label("mppt"));
        device.record_success(values, Utc::now());
        assert_eq!(device.consecutive_failures, 0);

        let mut values = BTreeMap::new();
        values.insert("battery_voltage".to_string(), DecodedValue::Float(14.4));
        device.record_success(values, Utc::now());

        let snapshot = device.snapshot();
        assert!(snapshot.available);
        assert_eq!(snapshot.values["battery_voltage"], DecodedValue::Float(14.4));
        assert!(!snapshot.values.contains_key("charging_status"));
    }
}
