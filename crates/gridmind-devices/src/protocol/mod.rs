//! Wire codecs.

pub mod crc16;
pub mod dsmr;
pub mod iec62056;
pub mod modbus;
pub mod obis;
pub mod xor_cipher;
