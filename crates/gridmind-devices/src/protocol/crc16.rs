//! CRC-16 with the reflected 0xA001 polynomial.
//!
//! Modbus RTU uses init `0xFFFF` and appends the result low byte first.
//! DSMR P1 telegrams use the same polynomial with init `0x0000`.

/// Reflected polynomial shared by Modbus and DSMR.
pub const POLY: u16 = 0xA001;

/// CRC-16/MODBUS.
pub fn crc16(data: &[u8]) -> u16 {
    crc16_with_init(data, 0xFFFF)
}

/// CRC-16 over `data` starting from `init`.
pub fn crc16_with_init(data: &[u8], init: u16) -> u16 {
    let mut crc = init;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Append the Modbus CRC (little-endian) to `frame`.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Check a frame whose last two bytes are its little-endian Modbus CRC.
pub fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    crc16(body) == u16::from_le_bytes([tail[0], tail[1]])
}
