//! Locating Modbus frames inside BLE notification data
//!
//! Some bridges prepend noise, append stale bytes, or strip the
//! `address/function/byte count` header and send only `payload + CRC`.
//! Normalization recovers a candidate frame in each case; the result still
//! goes through `frame::parse_response`, so the CRC decides whether it is
//! trusted.

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::constants::{
    read_response_len, CRC_LEN, EXCEPTION_FLAG, EXCEPTION_FRAME_LEN, FC_READ_HOLDING_REGISTERS,
    FC_WRITE_SINGLE_REGISTER, WRITE_FRAME_LEN,
};
use crate::crc::has_valid_crc;

/// A frame recovered from raw notification bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub frame: Vec<u8>,
    /// Number of leading bytes skipped before the header
    pub offset: usize,
    /// The header was missing and has been rebuilt from the request
    pub header_rebuilt: bool,
}

/// Recover a read response for `word_count` registers from `raw`
///
/// Returns `None` when `raw` cannot yet contain a complete frame.
pub fn normalize_response(
    raw: &[u8],
    device_addr: u8,
    function_code: u8,
    word_count: u16,
) -> Option<Normalized> {
    let byte_count = word_count as usize * 2;
    let expected_len = read_response_len(word_count);

    if raw.len() >= expected_len {
        let max_start = raw.len() - expected_len;
        let start = (0..=max_start)
            .find(|&start| {
                raw[start + 1] == function_code && raw[start + 2] as usize == byte_count
            })
            .unwrap_or(0);

        if start > 0 {
            debug!("Skipped {} leading bytes before Modbus header", start);
        }
        if raw.len() > start + expected_len {
            trace!(
                "Dropped {} trailing bytes after frame",
                raw.len() - start - expected_len
            );
        }

        return Some(Normalized {
            frame: raw[start..start + expected_len].to_vec(),
            offset: start,
            header_rebuilt: false,
        });
    }

    if raw.len() == byte_count + CRC_LEN && !starts_with_header(raw, function_code, byte_count) {
        let mut frame = Vec::with_capacity(expected_len);
        frame.push(device_addr);
        frame.push(function_code);
        frame.push(byte_count as u8);
        frame.extend_from_slice(raw);
        debug!("Rebuilt missing Modbus header for {}-byte payload", byte_count);
        return Some(Normalized {
            frame,
            offset: 0,
            header_rebuilt: true,
        });
    }

    None
}

fn starts_with_header(raw: &[u8], function_code: u8, byte_count: usize) -> bool {
    raw.len() >= 3 && raw[1] == function_code && raw[2] as usize == byte_count
}

/// Find a CRC-valid exception frame for `function_code` anywhere in `raw`
fn find_exception(raw: &[u8], function_code: u8) -> Option<Vec<u8>> {
    if raw.len() < EXCEPTION_FRAME_LEN {
        return None;
    }
    (0..=raw.len() - EXCEPTION_FRAME_LEN)
        .map(|start| &raw[start..start + EXCEPTION_FRAME_LEN])
        .find(|candidate| {
            candidate[1] == function_code | EXCEPTION_FLAG && has_valid_crc(candidate)
        })
        .map(<[u8]>::to_vec)
}

/// What the assembler waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedFrame {
    ReadResponse { word_count: u16 },
    WriteEcho,
}

impl ExpectedFrame {
    pub fn function_code(&self) -> u8 {
        match self {
            Self::ReadResponse { .. } => FC_READ_HOLDING_REGISTERS,
            Self::WriteEcho => FC_WRITE_SINGLE_REGISTER,
        }
    }

    /// Length of a complete, non-exception response
    pub fn frame_len(&self) -> usize {
        match self {
            Self::ReadResponse { word_count } => read_response_len(*word_count),
            Self::WriteEcho => WRITE_FRAME_LEN,
        }
    }
}

/// Concatenates notification fragments in arrival order until one full
/// response frame is available
#[derive(Debug)]
pub struct FrameAssembler {
    device_addr: u8,
    expected: ExpectedFrame,
    buffer: BytesMut,
}

impl FrameAssembler {
    pub fn new(device_addr: u8, expected: ExpectedFrame) -> Self {
        Self {
            device_addr,
            expected,
            buffer: BytesMut::with_capacity(expected.frame_len()),
        }
    }

    pub fn expected(&self) -> ExpectedFrame {
        self.expected
    }

    /// Bytes received so far
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Everything received so far, for diagnostics after a timeout
    pub fn partial(&self) -> &[u8] {
        &self.buffer
    }

    /// Append one notification; returns the complete frame once available
    pub fn push(&mut self, fragment: &[u8]) -> Option<Vec<u8>> {
        self.buffer.extend_from_slice(fragment);
        trace!(
            "Fragment {} bytes, buffered {}/{}",
            fragment.len(),
            self.buffer.len(),
            self.expected.frame_len()
        );

        let function_code = self.expected.function_code();
        if let Some(frame) = find_exception(&self.buffer, function_code) {
            return Some(frame);
        }

        match self.expected {
            ExpectedFrame::ReadResponse { word_count } => {
                let normalized = normalize_response(
                    &self.buffer,
                    self.device_addr,
                    function_code,
                    word_count,
                )?;
                let byte_count = word_count as usize * 2;
                let framed = normalized.header_rebuilt
                    || starts_with_header(&normalized.frame, function_code, byte_count);
                framed.then_some(normalized.frame)
            },
            ExpectedFrame::WriteEcho => {
                if self.buffer.len() < WRITE_FRAME_LEN {
                    return None;
                }
                let max_start = self.buffer.len() - WRITE_FRAME_LEN;
                let start = (0..=max_start).find(|&start| {
                    self.buffer[start] == self.device_addr
                        && self.buffer[start + 1] == FC_WRITE_SINGLE_REGISTER
                })?;
                Some(self.buffer[start..start + WRITE_FRAME_LEN].to_vec())
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::crc::append_crc;
    use crate::frame::{build_write_request, parse_response, RawPayload};

    const FRAME: [u8; 9] = [0xFF, 0x03, 0x04, 0x10, 0x11, 0x12, 0x13, 0xAA, 0xBB];

    #[test]
    fn test_normalize_clean_frame() {
        let normalized = normalize_response(&FRAME, 0xFF, 0x03, 2).unwrap();
        assert_eq!(normalized.frame, FRAME.to_vec());
        assert_eq!(normalized.offset, 0);
        assert!(!normalized.header_rebuilt);
    }

    #[test]
    fn test_normalize_strips_leading_noise() {
        let mut raw = vec![0x00, 0x00];
        raw.extend_from_slice(&FRAME);
        let normalized = normalize_response(&raw, 0xFF, 0x03, 2).unwrap();
        assert_eq!(normalized.frame, FRAME.to_vec());
        assert_eq!(normalized.offset, 2);
    }

    #[test]
    fn test_normalize_trims_suffix() {
        let mut raw = FRAME.to_vec();
        raw.push(0x99);
        let normalized = normalize_response(&raw, 0xFF, 0x03, 2).unwrap();
        assert_eq!(normalized.frame, FRAME.to_vec());
        assert_eq!(normalized.offset, 0);
    }

    #[test]
    fn test_normalize_rebuilds_header_for_payload_with_crc() {
        let raw = [0x10, 0x11, 0x12, 0x13, 0xAA, 0xBB];
        let normalized = normalize_response(&raw, 0xFF, 0x03, 2).unwrap();
        assert_eq!(normalized.frame, FRAME.to_vec());
        assert!(normalized.header_rebuilt);
    }

    #[test]
    fn test_normalize_payload_without_crc_is_incomplete() {
        assert!(normalize_response(&[0x10, 0x11, 0x12, 0x13], 0xFF, 0x03, 2).is_none());
    }

    #[test]
    fn test_rebuilt_header_still_crc_checked() {
        let mut full = vec![0xFF, 0x03, 0x04, 0x00, 0x92, 0x00, 0x05];
        append_crc(&mut full);
        let normalized = normalize_response(&full[3..], 0xFF, 0x03, 2).unwrap();
        assert_eq!(
            parse_response(&normalized.frame, 0xFF).unwrap(),
            RawPayload::Registers(vec![0x00, 0x92, 0x00, 0x05])
        );
    }

    #[test]
    fn test_assembler_joins_fragments_in_order() {
        let mut full = vec![0xFF, 0x03, 0x08];
        full.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        append_crc(&mut full);

        let mut assembler =
            FrameAssembler::new(0xFF, ExpectedFrame::ReadResponse { word_count: 4 });
        assert!(assembler.push(&full[..5]).is_none());
        assert!(assembler.push(&full[5..10]).is_none());
        assert_eq!(assembler.buffered(), 10);
        let frame = assembler.push(&full[10..]).unwrap();
        assert_eq!(frame, full);
    }

    #[test]
    fn test_assembler_detects_exception_early() {
        let mut exception = vec![0xFF, 0x83, 0x02];
        append_crc(&mut exception);

        let mut assembler =
            FrameAssembler::new(0xFF, ExpectedFrame::ReadResponse { word_count: 35 });
        let frame = assembler.push(&exception).unwrap();
        assert!(matches!(
            parse_response(&frame, 0xFF),
            Err(crate::frame::CodecError::ExceptionResponse { code: 0x02, .. })
        ));
    }

    #[test]
    fn test_assembler_waits_for_header() {
        let mut full = vec![0xFF, 0x03, 0x04, 0x00, 0x92, 0x00, 0x05];
        append_crc(&mut full);

        let mut assembler =
            FrameAssembler::new(0xFF, ExpectedFrame::ReadResponse { word_count: 2 });
        assert!(assembler.push(&[0x00, 0x00, 0xFF, 0x03, 0x04, 0x00, 0x92]).is_none());
        assert!(assembler.push(&[0x00]).is_none());
        assert_eq!(assembler.push(&full[6..]).unwrap(), full);
    }

    #[test]
    fn test_assembler_write_echo() {
        let echo = build_write_request(0xFF, 0xE004, 2);
        let mut assembler = FrameAssembler::new(0xFF, ExpectedFrame::WriteEcho);
        assert!(assembler.push(&echo[..3]).is_none());
        assert_eq!(assembler.push(&echo[3..]).unwrap(), echo);
        assert_eq!(assembler.partial(), echo.as_slice());
    }

    #[test]
    fn test_assembler_write_echo_skips_foreign_address() {
        let echo = build_write_request(0xFF, 0xE004, 2);
        let mut buffered = vec![0x01, 0x06, 0x00];
        buffered.extend_from_slice(&echo);

        let mut assembler = FrameAssembler::new(0xFF, ExpectedFrame::WriteEcho);
        assert!(assembler.push(&buffered[..8]).is_none());
        assert_eq!(assembler.push(&buffered[8..]).unwrap(), echo);
    }
}
