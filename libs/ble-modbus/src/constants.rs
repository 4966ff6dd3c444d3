//! Protocol constants for Modbus RTU frames carried over BLE GATT

/// Function code: read holding registers
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Function code: write single register
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Bit set in the function code byte of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Largest word count a single read request may ask for
pub const MAX_READ_WORDS: u16 = 125;

/// Broadcast-style address most BLE-bridged devices answer to
pub const DEFAULT_DEVICE_ADDRESS: u8 = 0xFF;

/// Smallest well-formed response (address, function, code/count, CRC)
pub const MIN_FRAME_LEN: usize = 5;

/// Exception responses are always address + function + code + CRC
pub const EXCEPTION_FRAME_LEN: usize = 5;

/// Write-single-register requests and their echoes are always 8 bytes
pub const WRITE_FRAME_LEN: usize = 8;

/// Address + function + byte count
pub const READ_HEADER_LEN: usize = 3;

/// Trailing CRC16
pub const CRC_LEN: usize = 2;

/// Total length of a read response carrying `word_count` registers
pub const fn read_response_len(word_count: u16) -> usize {
    READ_HEADER_LEN + word_count as usize * 2 + CRC_LEN
}

/// Human-readable Modbus exception code
pub fn exception_description(exception_code: u8) -> &'static str {
    match exception_code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x07 => "Negative Acknowledge",
        0x08 => "Memory Parity Error",
        _ => "Unknown Exception",
    }
}
