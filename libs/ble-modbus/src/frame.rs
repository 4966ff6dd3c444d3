//! Modbus RTU frame building and response validation
//!
//! Requests are plain RTU frames: device address, function code, payload and
//! a CRC16 transmitted low byte first. Responses are validated in a fixed
//! order: length, CRC, device address, exception flag, function code.

use thiserror::Error;
use tracing::trace;

use crate::constants::{
    exception_description, read_response_len, EXCEPTION_FLAG, EXCEPTION_FRAME_LEN,
    FC_READ_HOLDING_REGISTERS, FC_WRITE_SINGLE_REGISTER, MAX_READ_WORDS, MIN_FRAME_LEN,
    WRITE_FRAME_LEN,
};
use crate::crc::{append_crc, crc16};

/// Frame-level failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Word count {0} outside 1..={max}", max = MAX_READ_WORDS)]
    InvalidWordCount(u16),

    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("CRC mismatch: computed {expected:#06X}, frame carries {actual:#06X}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("Address mismatch: expected {expected:#04X}, got {actual:#04X}")]
    AddressMismatch { expected: u8, actual: u8 },

    #[error(
        "Exception response {code:#04X} ({}) for function {function:#04X}",
        exception_description(*.code)
    )]
    ExceptionResponse { function: u8, code: u8 },

    #[error("Unexpected function code {0:#04X}")]
    UnexpectedFunction(u8),
}

/// Validated response content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPayload {
    /// Data block of a read response (byte count stripped)
    Registers(Vec<u8>),
    /// Echo of a write-single-register request
    WriteEcho { register: u16, value: u16 },
}

impl RawPayload {
    /// Whether this is the exact echo of a write of `value` to `register`
    pub fn is_echo_of(&self, register: u16, value: u16) -> bool {
        matches!(self, Self::WriteEcho { register: r, value: v } if *r == register && *v == value)
    }
}

/// Build a read-holding-registers request
///
/// # Arguments
/// * `device_addr` - Modbus address of the target device
/// * `start_register` - First register to read
/// * `word_count` - Number of registers, 1 to 125
pub fn build_read_request(
    device_addr: u8,
    start_register: u16,
    word_count: u16,
) -> Result<Vec<u8>, CodecError> {
    if word_count == 0 || word_count > MAX_READ_WORDS {
        return Err(CodecError::InvalidWordCount(word_count));
    }

    let mut frame = Vec::with_capacity(8);
    frame.push(device_addr);
    frame.push(FC_READ_HOLDING_REGISTERS);
    frame.extend_from_slice(&start_register.to_be_bytes());
    frame.extend_from_slice(&word_count.to_be_bytes());
    append_crc(&mut frame);

    trace!(
        "Read request addr={:02X} reg={:04X} count={}: {}",
        device_addr,
        start_register,
        word_count,
        hex::encode(&frame)
    );
    Ok(frame)
}

/// Build a write-single-register request
///
/// Range checks belong to the register map; any 16-bit value is framed.
pub fn build_write_request(device_addr: u8, register: u16, value: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(WRITE_FRAME_LEN);
    frame.push(device_addr);
    frame.push(FC_WRITE_SINGLE_REGISTER);
    frame.extend_from_slice(&register.to_be_bytes());
    frame.extend_from_slice(&value.to_be_bytes());
    append_crc(&mut frame);
    frame
}

/// Length the frame should have, judged from its function and count bytes
fn expected_frame_len(bytes: &[u8]) -> usize {
    let function = bytes[1];
    if function & EXCEPTION_FLAG != 0 {
        EXCEPTION_FRAME_LEN
    } else {
        match function {
            FC_READ_HOLDING_REGISTERS => read_response_len(0) + bytes[2] as usize,
            FC_WRITE_SINGLE_REGISTER => WRITE_FRAME_LEN,
            _ => bytes.len(),
        }
    }
}

/// Validate a complete response frame and extract its payload
///
/// # Arguments
/// * `bytes` - One complete frame (see `normalize` for locating it in noise)
/// * `expected_device_addr` - Address the request was sent to
///
/// The address is checked before the exception flag so an exception frame
/// from another device on the same link is reported as cross-talk.
pub fn parse_response(bytes: &[u8], expected_device_addr: u8) -> Result<RawPayload, CodecError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(CodecError::Truncated {
            expected: MIN_FRAME_LEN,
            actual: bytes.len(),
        });
    }

    let expected_len = expected_frame_len(bytes);
    if bytes.len() != expected_len {
        return Err(CodecError::Truncated {
            expected: expected_len,
            actual: bytes.len(),
        });
    }

    let (body, tail) = bytes.split_at(bytes.len() - 2);
    let computed = crc16(body);
    let carried = u16::from_le_bytes([tail[0], tail[1]]);
    if computed != carried {
        return Err(CodecError::CrcMismatch {
            expected: computed,
            actual: carried,
        });
    }

    if body[0] != expected_device_addr {
        return Err(CodecError::AddressMismatch {
            expected: expected_device_addr,
            actual: body[0],
        });
    }

    let function = body[1];
    if function & EXCEPTION_FLAG != 0 {
        return Err(CodecError::ExceptionResponse {
            function: function & !EXCEPTION_FLAG,
            code: body[2],
        });
    }

    match function {
        FC_READ_HOLDING_REGISTERS => Ok(RawPayload::Registers(body[3..].to_vec())),
        FC_WRITE_SINGLE_REGISTER => Ok(RawPayload::WriteEcho {
            register: u16::from_be_bytes([body[2], body[3]]),
            value: u16::from_be_bytes([body[4], body[5]]),
        }),
        other => Err(CodecError::UnexpectedFunction(other)),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::crc::append_crc;

    fn framed(bytes: &[u8]) -> Vec<u8> {
        let mut frame = bytes.to_vec();
        append_crc(&mut frame);
        frame
    }

    #[test]
    fn test_build_read_request_layout() {
        let frame = build_read_request(0x01, 0x0000, 1).unwrap();
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);

        let frame = build_read_request(0xFF, 0x0100, 35).unwrap();
        assert_eq!(&frame[..6], &[0xFF, 0x03, 0x01, 0x00, 0x00, 0x23]);
    }

    #[test]
    fn test_build_read_request_rejects_word_count() {
        assert_eq!(
            build_read_request(0xFF, 0x0100, 0),
            Err(CodecError::InvalidWordCount(0))
        );
        assert_eq!(
            build_read_request(0xFF, 0x0100, 126),
            Err(CodecError::InvalidWordCount(126))
        );
        assert!(build_read_request(0xFF, 0x0100, 125).is_ok());
    }

    #[test]
    fn test_build_write_request_layout() {
        let frame = build_write_request(0xFF, 0xE004, 2);
        assert_eq!(frame.len(), 8);
        assert_eq!(&frame[..6], &[0xFF, 0x06, 0xE0, 0x04, 0x00, 0x02]);
        assert!(crate::crc::has_valid_crc(&frame));
    }

    #[test]
    fn test_parse_read_response() {
        let frame = framed(&[0xFF, 0x03, 0x04, 0x00, 0x92, 0x00, 0x05]);
        let payload = parse_response(&frame, 0xFF).unwrap();
        assert_eq!(payload, RawPayload::Registers(vec![0x00, 0x92, 0x00, 0x05]));
    }

    #[test]
    fn test_parse_write_echo() {
        let frame = build_write_request(0xFF, 0xE004, 2);
        let payload = parse_response(&frame, 0xFF).unwrap();
        assert!(payload.is_echo_of(0xE004, 2));
        assert!(!payload.is_echo_of(0xE004, 3));
    }

    #[test]
    fn test_parse_truncated() {
        assert_eq!(
            parse_response(&[0xFF, 0x03, 0x02, 0x00], 0xFF),
            Err(CodecError::Truncated {
                expected: 5,
                actual: 4
            })
        );

        // Declared byte count larger than what arrived
        let frame = framed(&[0xFF, 0x03, 0x04, 0x00, 0x92]);
        assert_eq!(
            parse_response(&frame, 0xFF),
            Err(CodecError::Truncated {
                expected: 9,
                actual: 7
            })
        );
    }

    #[test]
    fn test_parse_crc_mismatch() {
        let mut frame = framed(&[0xFF, 0x03, 0x02, 0x00, 0x92]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            parse_response(&frame, 0xFF),
            Err(CodecError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_parse_accepts_iff_crc_matches() {
        let body = [0xFF, 0x03, 0x02, 0x12, 0x34];
        let good = crc16(&body);
        for candidate in [good, good ^ 0x0001, good.rotate_left(8), 0x0000] {
            let mut frame = body.to_vec();
            frame.extend_from_slice(&candidate.to_le_bytes());
            assert_eq!(parse_response(&frame, 0xFF).is_ok(), candidate == good);
        }
    }

    #[test]
    fn test_parse_exception_response() {
        let frame = framed(&[0xFF, 0x83, 0x02]);
        let err = parse_response(&frame, 0xFF).unwrap_err();
        assert_eq!(
            err,
            CodecError::ExceptionResponse {
                function: 0x03,
                code: 0x02
            }
        );
        assert!(err.to_string().contains("Illegal Data Address"));
    }

    #[test]
    fn test_parse_address_mismatch_wins_over_exception() {
        let frame = framed(&[0x01, 0x83, 0x02]);
        assert_eq!(
            parse_response(&frame, 0xFF),
            Err(CodecError::AddressMismatch {
                expected: 0xFF,
                actual: 0x01
            })
        );

        let frame = framed(&[0x10, 0x03, 0x02, 0x00, 0x01]);
        assert!(matches!(
            parse_response(&frame, 0xFF),
            Err(CodecError::AddressMismatch { actual: 0x10, .. })
        ));
    }

    #[test]
    fn test_parse_unexpected_function() {
        let frame = framed(&[0xFF, 0x04, 0x02, 0x00, 0x01]);
        assert_eq!(
            parse_response(&frame, 0xFF),
            Err(CodecError::UnexpectedFunction(0x04))
        );
    }
}
