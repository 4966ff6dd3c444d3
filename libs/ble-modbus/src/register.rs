//! Register field descriptors and decoding
//!
//! A [`RegisterField`] describes where one quantity lives inside the data
//! block returned for a command and how to turn its bytes into a value.
//! Decoding is per field: a field that cannot be decoded is dropped from the
//! result and reported as a [`FieldDiagnostic`] while the rest still decode.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// How the raw bytes of a field are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldEncoding {
    /// Big-endian unsigned integer
    Unsigned,
    /// Big-endian two's complement
    Signed,
    /// Top bit is the sign, remaining bits the magnitude (temperatures)
    SignMagnitude,
    /// ASCII text padded with NUL or spaces
    Ascii,
}

/// Descriptor of one decodable quantity
#[derive(Debug, Clone, Copy)]
pub struct RegisterField {
    pub name: &'static str,
    /// Command whose response carries this field
    pub command: &'static str,
    /// First register the field occupies
    pub register: u16,
    /// Byte offset within the command's data block
    pub offset: usize,
    /// Byte length; 1..=4 for numbers
    pub length: usize,
    pub encoding: FieldEncoding,
    pub scale: Option<f64>,
    /// Applied to the raw value and shifted down to bit 0
    pub mask: Option<u32>,
    /// Enumeration labels
    pub values: &'static [(u32, &'static str)],
    /// Fault bit labels
    pub bits: &'static [(u8, &'static str)],
    pub unit: Option<&'static str>,
}

impl RegisterField {
    pub const fn new(
        name: &'static str,
        command: &'static str,
        register: u16,
        offset: usize,
        length: usize,
    ) -> Self {
        Self {
            name,
            command,
            register,
            offset,
            length,
            encoding: FieldEncoding::Unsigned,
            scale: None,
            mask: None,
            values: &[],
            bits: &[],
            unit: None,
        }
    }

    pub const fn scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub const fn encoding(mut self, encoding: FieldEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub const fn mask(mut self, mask: u32) -> Self {
        self.mask = Some(mask);
        self
    }

    pub const fn values(mut self, values: &'static [(u32, &'static str)]) -> Self {
        self.values = values;
        self
    }

    pub const fn bits(mut self, bits: &'static [(u8, &'static str)]) -> Self {
        self.bits = bits;
        self
    }

    pub const fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Last byte (exclusive) this field reads
    pub const fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// A decoded field value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DecodedValue {
    Integer(i64),
    Float(f64),
    Label(&'static str),
    Flags(Vec<&'static str>),
    Text(String),
}

impl DecodedValue {
    /// Numeric view, for derived quantities
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// Field-scoped decode failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Value {raw} has no label")]
    UnmappedEnumValue { raw: u32 },

    #[error("Field needs bytes {offset}..{end} but only {available} are present", end = .offset + .length)]
    OutOfBounds {
        offset: usize,
        length: usize,
        available: usize,
    },

    #[error("Unsupported numeric field length {0}")]
    UnsupportedLength(usize),
}

/// Why a field is missing from a decode result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDiagnostic {
    pub field: &'static str,
    pub error: DecodeError,
}

/// Decode result: values by field name plus per-field diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Decoded {
    pub values: BTreeMap<String, DecodedValue>,
    #[serde(skip)]
    pub diagnostics: Vec<FieldDiagnostic>,
}

impl Decoded {
    pub fn get(&self, name: &str) -> Option<&DecodedValue> {
        self.values.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Fold another result into this one; later values win on name clashes
    pub fn merge(&mut self, other: Decoded) {
        self.values.extend(other.values);
        self.diagnostics.extend(other.diagnostics);
    }
}

/// Round to the number of decimals the scale factor carries (0.1 -> 1, 0.001 -> 3)
pub fn round_to_scale(value: f64, scale: f64) -> f64 {
    let decimals = (-scale.abs().log10()).ceil().clamp(0.0, 6.0) as i32;
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn read_unsigned(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte))
}

/// Decode one field from a command's data block
pub fn decode_field(field: &RegisterField, data: &[u8]) -> Result<DecodedValue, DecodeError> {
    if field.end() > data.len() {
        return Err(DecodeError::OutOfBounds {
            offset: field.offset,
            length: field.length,
            available: data.len(),
        });
    }
    let bytes = &data[field.offset..field.end()];

    if field.encoding == FieldEncoding::Ascii {
        let text = String::from_utf8_lossy(bytes);
        return Ok(DecodedValue::Text(
            text.trim_matches(|c: char| c == '\0' || c.is_whitespace())
                .to_string(),
        ));
    }

    if field.length == 0 || field.length > 4 {
        return Err(DecodeError::UnsupportedLength(field.length));
    }

    let mut raw = read_unsigned(bytes);
    if let Some(mask) = field.mask {
        raw = (raw & mask).checked_shr(mask.trailing_zeros()).unwrap_or(0);
    }

    if !field.values.is_empty() {
        return field
            .values
            .iter()
            .find(|(value, _)| *value == raw)
            .map(|(_, label)| DecodedValue::Label(*label))
            .ok_or(DecodeError::UnmappedEnumValue { raw });
    }

    if !field.bits.is_empty() {
        let flags = field
            .bits
            .iter()
            .filter(|(bit, _)| raw & (1u32 << bit) != 0)
            .map(|(_, label)| *label)
            .collect();
        return Ok(DecodedValue::Flags(flags));
    }

    let width = field.length as u32 * 8;
    let number = match field.encoding {
        FieldEncoding::Signed => {
            let shift = 64 - width;
            (((raw as u64) << shift) as i64) >> shift
        },
        FieldEncoding::SignMagnitude => {
            let sign_bit = 1u32 << (width - 1);
            let magnitude = i64::from(raw & !sign_bit);
            if raw & sign_bit != 0 {
                -magnitude
            } else {
                magnitude
            }
        },
        _ => i64::from(raw),
    };

    Ok(match field.scale {
        Some(scale) => DecodedValue::Float(round_to_scale(number as f64 * scale, scale)),
        None => DecodedValue::Integer(number),
    })
}

/// Decode every field in `fields` from `data`
///
/// Pure and deterministic: the same bytes and fields always produce the
/// same result.
pub fn decode<'a, I>(data: &[u8], fields: I) -> Decoded
where
    I: IntoIterator<Item = &'a RegisterField>,
{
    let mut decoded = Decoded::default();
    for field in fields {
        match decode_field(field, data) {
            Ok(value) => {
                decoded.values.insert(field.name.to_string(), value);
            },
            Err(error) => {
                warn!("Field {} not decoded: {}", field.name, error);
                decoded.diagnostics.push(FieldDiagnostic {
                    field: field.name,
                    error,
                });
            },
        }
    }
    decoded
}

/// Rejected write values
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WriteValidationError {
    #[error("{name}: {value} outside [{min}, {max}]")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{name}: unknown option '{label}'")]
    UnknownLabel { name: &'static str, label: String },

    #[error("No writable register named '{0}'")]
    NotWritable(String),
}

/// A register that may be written, with the accepted raw range
#[derive(Debug, Clone, Copy)]
pub struct WritableRegister {
    pub name: &'static str,
    pub register: u16,
    pub min: u16,
    pub max: u16,
    pub scale: Option<f64>,
    pub values: &'static [(u32, &'static str)],
}

impl WritableRegister {
    pub const fn new(name: &'static str, register: u16, min: u16, max: u16) -> Self {
        Self {
            name,
            register,
            min,
            max,
            scale: None,
            values: &[],
        }
    }

    pub const fn scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub const fn values(mut self, values: &'static [(u32, &'static str)]) -> Self {
        self.values = values;
        self
    }

    fn to_engineering(&self, raw: u16) -> f64 {
        let scale = self.scale.unwrap_or(1.0);
        round_to_scale(f64::from(raw) * scale, scale)
    }

    /// Check a raw register value against the accepted range
    pub fn validate(&self, raw: u16) -> Result<u16, WriteValidationError> {
        if raw < self.min || raw > self.max {
            return Err(WriteValidationError::OutOfRange {
                name: self.name,
                value: self.to_engineering(raw),
                min: self.to_engineering(self.min),
                max: self.to_engineering(self.max),
            });
        }
        Ok(raw)
    }

    /// Convert an engineering value (volts, seconds, amps) to a raw register value
    pub fn encode(&self, value: f64) -> Result<u16, WriteValidationError> {
        let raw = (value / self.scale.unwrap_or(1.0)).round();
        if !raw.is_finite() || raw < f64::from(self.min) || raw > f64::from(self.max) {
            return Err(WriteValidationError::OutOfRange {
                name: self.name,
                value,
                min: self.to_engineering(self.min),
                max: self.to_engineering(self.max),
            });
        }
        self.validate(raw as u16)
    }

    /// Convert an option label (e.g. "lithium") to its raw value
    pub fn encode_label(&self, label: &str) -> Result<u16, WriteValidationError> {
        let raw = self
            .values
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(label))
            .map(|(value, _)| *value)
            .ok_or_else(|| WriteValidationError::UnknownLabel {
                name: self.name,
                label: label.to_string(),
            })?;
        self.validate(raw as u16)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    const CHARGING: &[(u32, &str)] = &[(0, "deactivated"), (2, "mppt"), (5, "floating")];
    const FAULTS: &[(u8, &str)] = &[(0, "first"), (17, "battery_over_voltage"), (30, "last")];

    #[test]
    fn test_scaled_value() {
        let field = RegisterField::new("battery_voltage", "dynamic_data", 0x0101, 0, 2).scale(0.1);
        assert_eq!(
            decode_field(&field, &[0x00, 0x92]).unwrap(),
            DecodedValue::Float(14.6)
        );
    }

    #[test]
    fn test_unscaled_value() {
        let field = RegisterField::new("pv_power", "dynamic_data", 0x0109, 1, 2);
        assert_eq!(
            decode_field(&field, &[0xAA, 0x01, 0x2C]).unwrap(),
            DecodedValue::Integer(300)
        );
    }

    #[test]
    fn test_enum_value_and_unmapped() {
        let field = RegisterField::new("charging_status", "dynamic_data", 0x0120, 0, 1)
            .values(CHARGING);
        assert_eq!(
            decode_field(&field, &[5]).unwrap(),
            DecodedValue::Label("floating")
        );
        assert_eq!(
            decode_field(&field, &[7]),
            Err(DecodeError::UnmappedEnumValue { raw: 7 })
        );
    }

    #[test]
    fn test_masked_enum() {
        let field = RegisterField::new("load_status", "dynamic_data", 0x0120, 0, 1)
            .mask(0x80)
            .values(&[(0, "off"), (1, "on")]);
        assert_eq!(
            decode_field(&field, &[0x85]).unwrap(),
            DecodedValue::Label("on")
        );
        assert_eq!(
            decode_field(&field, &[0x05]).unwrap(),
            DecodedValue::Label("off")
        );
    }

    #[test]
    fn test_thirty_two_bit_value_is_most_significant_word_first() {
        let field = RegisterField::new("power_generation_total", "dynamic_data", 0x011C, 0, 4);
        assert_eq!(
            decode_field(&field, &[0x00, 0x01, 0x00, 0x02]).unwrap(),
            DecodedValue::Integer(65538)
        );
    }

    #[test]
    fn test_bitfield() {
        let field = RegisterField::new("fault_codes", "dynamic_data", 0x0121, 0, 4).bits(FAULTS);
        assert_eq!(
            decode_field(&field, &[0x40, 0x02, 0x00, 0x00]).unwrap(),
            DecodedValue::Flags(vec!["battery_over_voltage", "last"])
        );
        assert_eq!(
            decode_field(&field, &[0, 0, 0, 0]).unwrap(),
            DecodedValue::Flags(vec![])
        );
    }

    #[test]
    fn test_sign_magnitude_temperature() {
        let field = RegisterField::new("controller_temperature", "dynamic_data", 0x0103, 0, 1)
            .encoding(FieldEncoding::SignMagnitude);
        assert_eq!(decode_field(&field, &[0x19]).unwrap(), DecodedValue::Integer(25));
        assert_eq!(decode_field(&field, &[0x85]).unwrap(), DecodedValue::Integer(-5));
    }

    #[test]
    fn test_signed_three_byte_value() {
        let field = RegisterField::new("battery_current", "telemetry", 0, 0, 3)
            .encoding(FieldEncoding::Signed)
            .scale(0.001);
        assert_eq!(
            decode_field(&field, &[0xFF, 0xFC, 0x18]).unwrap(),
            DecodedValue::Float(-1.0)
        );
        assert_eq!(
            decode_field(&field, &[0x00, 0x13, 0x88]).unwrap(),
            DecodedValue::Float(5.0)
        );
    }

    #[test]
    fn test_ascii_text() {
        let field = RegisterField::new("model", "device_info", 0x000C, 0, 8)
            .encoding(FieldEncoding::Ascii);
        assert_eq!(
            decode_field(&field, b"  RNG-10").unwrap(),
            DecodedValue::Text("RNG-10".to_string())
        );
        assert_eq!(
            decode_field(&field, b"RNG\0\0\0\0\0").unwrap(),
            DecodedValue::Text("RNG".to_string())
        );
    }

    #[test]
    fn test_out_of_bounds_is_diagnostic() {
        let fields = [
            RegisterField::new("present", "x", 0, 0, 2),
            RegisterField::new("missing", "x", 0, 2, 2),
        ];
        let decoded = decode(&[0x00, 0x01], &fields);
        assert_eq!(decoded.get("present"), Some(&DecodedValue::Integer(1)));
        assert!(decoded.get("missing").is_none());
        assert_eq!(decoded.diagnostics.len(), 1);
        assert_eq!(decoded.diagnostics[0].field, "missing");
    }

    #[test]
    fn test_unmapped_enum_does_not_fail_other_fields() {
        let fields = [
            RegisterField::new("voltage", "x", 0, 0, 2).scale(0.1),
            RegisterField::new("status", "x", 0, 2, 1).values(CHARGING),
        ];
        let decoded = decode(&[0x00, 0x92, 0x07], &fields);
        assert_eq!(decoded.get("voltage"), Some(&DecodedValue::Float(14.6)));
        assert_eq!(
            decoded.diagnostics,
            vec![FieldDiagnostic {
                field: "status",
                error: DecodeError::UnmappedEnumValue { raw: 7 }
            }]
        );
    }

    #[test]
    fn test_decode_is_deterministic() {
        let fields = [
            RegisterField::new("a", "x", 0, 0, 2).scale(0.01),
            RegisterField::new("b", "x", 0, 2, 2),
        ];
        let data = [0x04, 0xD2, 0x00, 0x2A];
        assert_eq!(decode(&data, &fields), decode(&data, &fields));
    }

    #[test]
    fn test_round_to_scale() {
        assert_eq!(round_to_scale(146.0 * 0.1, 0.1), 14.6);
        assert_eq!(round_to_scale(1234.0 * 0.01, 0.01), 12.34);
        assert_eq!(round_to_scale(12.0 * 10.0, 10.0), 120.0);
    }

    #[test]
    fn test_writable_register_ranges() {
        let voltage = WritableRegister::new("float_voltage", 0xE009, 70, 170).scale(0.1);
        assert_eq!(voltage.encode(13.8).unwrap(), 138);
        assert!(matches!(
            voltage.encode(17.5),
            Err(WriteValidationError::OutOfRange { .. })
        ));
        assert!(voltage.validate(69).is_err());
        assert_eq!(voltage.validate(170).unwrap(), 170);

        let battery = WritableRegister::new("battery_type", 0xE004, 1, 5)
            .values(&[(1, "open"), (4, "lithium")]);
        assert_eq!(battery.encode_label("Lithium").unwrap(), 4);
        assert!(matches!(
            battery.encode_label("nickel"),
            Err(WriteValidationError::UnknownLabel { .. })
        ));
    }
}
