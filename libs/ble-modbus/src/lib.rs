//! Modbus RTU over BLE GATT
//!
//! Frame building and validation, recovery of frames from notification
//! fragments, register decoding and the built-in register maps for solar
//! charge controllers, DC-DC chargers and battery shunts.
//!
//! Everything in this crate is pure: no I/O, no clocks.

pub mod constants;
pub mod crc;
pub mod frame;
pub mod models;
pub mod normalize;
pub mod register;
pub mod shunt;

pub use constants::DEFAULT_DEVICE_ADDRESS;
pub use crc::crc16;
pub use frame::{build_read_request, build_write_request, parse_response, CodecError, RawPayload};
pub use models::{Command, DeviceModel, ModelProtocol, RegisterMap};
pub use normalize::{normalize_response, ExpectedFrame, FrameAssembler, Normalized};
pub use register::{
    decode, decode_field, DecodeError, Decoded, DecodedValue, FieldDiagnostic, FieldEncoding,
    RegisterField, WritableRegister, WriteValidationError,
};
pub use shunt::{parse_shunt_packet, ShuntError};
