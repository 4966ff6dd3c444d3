//! CRC-16/MODBUS (reflected polynomial 0xA001, init 0xFFFF, no final xor)

use crc::{Crc, CRC_16_MODBUS};

const MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Checksum over `bytes`; transmitted low byte first
pub fn crc16(bytes: &[u8]) -> u16 {
    MODBUS.checksum(bytes)
}

/// Append the CRC of everything already in `frame`
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Whether the trailing two bytes equal the CRC of the bytes before them
pub fn has_valid_crc(frame: &[u8]) -> bool {
    if frame.len() < 2 {
        return false;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    crc16(body) == u16::from_le_bytes([tail[0], tail[1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_known_read_request() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
    }

    #[test]
    fn test_crc_empty_input_is_init_value() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_crc_check_string() {
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_append_and_validate() {
        let mut frame = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        append_crc(&mut frame);
        assert_eq!(&frame[6..], &[0x84, 0x0A]);
        assert!(has_valid_crc(&frame));

        frame[3] ^= 0x01;
        assert!(!has_valid_crc(&frame));
        assert!(!has_valid_crc(&[0x01]));
    }
}
