//! Battery shunt telemetry packets
//!
//! The shunt does not answer Modbus requests. It streams `"BW"` packets
//! (110 bytes nominal) on its notify characteristic; the fields below sit at
//! fixed offsets from the start of the packet.

use thiserror::Error;
use tracing::debug;

use crate::register::{decode, round_to_scale, Decoded, DecodedValue, FieldEncoding, RegisterField};

/// Packet header bytes
pub const SHUNT_HEADER: &[u8; 2] = b"BW";

/// Shortest packet that still carries every decoded field
pub const SHUNT_MIN_PACKET_LEN: usize = 36;

/// Nominal packet length
pub const SHUNT_PACKET_LEN: usize = 110;

pub const SHUNT_FIELDS: &[RegisterField] = &[
    RegisterField::new("sequence", "telemetry", 0, 2, 2),
    RegisterField::new("battery_current", "telemetry", 0, 21, 3)
        .encoding(FieldEncoding::Signed)
        .scale(0.001)
        .unit("A"),
    RegisterField::new("battery_voltage", "telemetry", 0, 25, 3)
        .scale(0.001)
        .unit("V"),
    RegisterField::new("starter_voltage", "telemetry", 0, 30, 2)
        .scale(0.001)
        .unit("V"),
    RegisterField::new("state_of_charge", "telemetry", 0, 34, 2)
        .scale(0.1)
        .unit("%"),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShuntError {
    #[error("Shunt packet too short: {0} bytes (need {min})", min = SHUNT_MIN_PACKET_LEN)]
    TooShort(usize),

    #[error("Invalid shunt packet header {0}")]
    BadHeader(String),
}

/// Quick structural check without decoding
pub fn is_shunt_packet(data: &[u8]) -> bool {
    data.len() >= SHUNT_MIN_PACKET_LEN && data.starts_with(SHUNT_HEADER)
}

/// Decode one telemetry packet; `power` is derived as voltage x current
pub fn parse_shunt_packet(data: &[u8]) -> Result<Decoded, ShuntError> {
    if data.len() < SHUNT_MIN_PACKET_LEN {
        return Err(ShuntError::TooShort(data.len()));
    }
    if !data.starts_with(SHUNT_HEADER) {
        return Err(ShuntError::BadHeader(hex::encode(&data[..2])));
    }

    let mut decoded = decode(data, SHUNT_FIELDS);

    let voltage = decoded.get("battery_voltage").and_then(DecodedValue::as_f64);
    let current = decoded.get("battery_current").and_then(DecodedValue::as_f64);
    if let (Some(voltage), Some(current)) = (voltage, current) {
        decoded.values.insert(
            "power".to_string(),
            DecodedValue::Float(round_to_scale(voltage * current, 0.01)),
        );
    }

    debug!(
        "Shunt packet seq={:?} V={:?} A={:?}",
        decoded.get("sequence"),
        voltage,
        current
    );
    Ok(decoded)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn packet() -> Vec<u8> {
        let mut data = vec![0u8; SHUNT_PACKET_LEN];
        data[0..2].copy_from_slice(SHUNT_HEADER);
        data[2..4].copy_from_slice(&42u16.to_be_bytes());
        // -2.500 A discharge
        data[21..24].copy_from_slice(&(-2500i32).to_be_bytes()[1..]);
        // 13.200 V
        data[25..28].copy_from_slice(&13_200u32.to_be_bytes()[1..]);
        data[30..32].copy_from_slice(&12_650u16.to_be_bytes());
        data[34..36].copy_from_slice(&875u16.to_be_bytes());
        data
    }

    #[test]
    fn test_parse_shunt_packet() {
        let decoded = parse_shunt_packet(&packet()).unwrap();
        assert_eq!(decoded.get("sequence"), Some(&DecodedValue::Integer(42)));
        assert_eq!(decoded.get("battery_current"), Some(&DecodedValue::Float(-2.5)));
        assert_eq!(decoded.get("battery_voltage"), Some(&DecodedValue::Float(13.2)));
        assert_eq!(decoded.get("starter_voltage"), Some(&DecodedValue::Float(12.65)));
        assert_eq!(decoded.get("state_of_charge"), Some(&DecodedValue::Float(87.5)));
        assert_eq!(decoded.get("power"), Some(&DecodedValue::Float(-33.0)));
    }

    #[test]
    fn test_minimum_length_packet() {
        let decoded = parse_shunt_packet(&packet()[..SHUNT_MIN_PACKET_LEN]).unwrap();
        assert!(decoded.diagnostics.is_empty());
    }

    #[test]
    fn test_rejects_short_and_bad_header() {
        assert_eq!(parse_shunt_packet(&[0x42, 0x57, 0x00]), Err(ShuntError::TooShort(3)));

        let mut data = packet();
        data[0] = 0x00;
        assert_eq!(
            parse_shunt_packet(&data),
            Err(ShuntError::BadHeader("0057".to_string()))
        );
        assert!(!is_shunt_packet(&data));
        assert!(is_shunt_packet(&packet()));
    }
}
