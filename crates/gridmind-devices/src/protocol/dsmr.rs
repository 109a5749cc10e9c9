//! DSMR P1 telegrams.
//!
//! A smart meter pushes one telegram every 1-10 s at 115200 8N1:
//! `/<ident>\r\n\r\n<OBIS lines>!<CRC16 hex>\r\n`. The CRC covers every byte
//! from `/` through `!` (polynomial 0xA001, init 0x0000). DSMR 2.x meters
//! send no CRC; their trailer is a bare `!`.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::crc16::crc16_with_init;
use crate::adapter::{AdapterError, AdapterResult};

pub const P1_BAUD: u32 = 115_200;

/// Largest telegram accepted before giving up.
const MAX_TELEGRAM: usize = 8 * 1024;

/// CRC of a telegram body, `/` through `!` inclusive.
pub fn telegram_crc(body: &[u8]) -> u16 {
    crc16_with_init(body, 0x0000)
}

/// Append `XXXX\r\n` to a body ending in `!`.
pub fn seal(body: &str) -> String {
    format!("{}{:04X}\r\n", body, telegram_crc(body.as_bytes()))
}

/// Validate a complete telegram and return its text from `/` to `!`.
pub fn verify_telegram(raw: &[u8]) -> AdapterResult<String> {
    let start = raw
        .iter()
        .position(|&b| b == b'/')
        .ok_or_else(|| AdapterError::protocol("telegram header '/' not found"))?;
    let bang = raw[start..]
        .iter()
        .position(|&b| b == b'!')
        .map(|p| p + start)
        .ok_or_else(|| AdapterError::protocol("telegram trailer '!' not found"))?;

    let body = &raw[start..=bang];
    let trailer: String = raw[bang + 1..]
        .iter()
        .take_while(|b| b.is_ascii_hexdigit())
        .map(|&b| b as char)
        .collect();

    if !trailer.is_empty() {
        let expected = u16::from_str_radix(&trailer, 16)
            .map_err(|_| AdapterError::Protocol(format!("bad CRC trailer {:?}", trailer)))?;
        let actual = telegram_crc(body);
        if actual != expected {
            return Err(AdapterError::Protocol(format!(
                "telegram CRC mismatch: trailer {:04X}, computed {:04X}",
                expected, actual
            )));
        }
    }

    String::from_utf8(body.to_vec()).map_err(|_| AdapterError::protocol("telegram is not ASCII"))
}

/// Read bytes until one complete telegram (through its CRLF after `!`) arrived.
pub async fn read_telegram<R>(io: &mut R) -> AdapterResult<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut raw = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];
    let mut started = false;
    let mut after_bang = false;

    loop {
        if io.read(&mut byte).await? == 0 {
            return Err(AdapterError::Transport("P1 port closed mid-telegram".into()));
        }
        let b = byte[0];
        if !started {
            // Skip the tail of a telegram we joined halfway through.
            if b != b'/' {
                continue;
            }
            started = true;
        }
        raw.push(b);
        if raw.len() > MAX_TELEGRAM {
            return Err(AdapterError::protocol("telegram exceeds size limit"));
        }
        if b == b'!' {
            after_bang = true;
        } else if after_bang && b == b'\n' {
            return Ok(raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const BODY: &str = "/ISk5\\2MT382-1000\r\n\r\n\
        1-3:0.2.8(50)\r\n\
        1-0:1.8.1(000123.456*kWh)\r\n\
        1-0:1.7.0(00.420*kW)\r\n\
        !";

    #[test]
    fn test_seal_and_verify() {
        let telegram = seal(BODY);
        let text = verify_telegram(telegram.as_bytes()).unwrap();
        assert!(text.starts_with('/'));
        assert!(text.ends_with('!'));
    }

    #[test]
    fn test_corrupted_telegram_rejected() {
        let telegram = seal(BODY).replace("00.420", "00.421");
        assert!(matches!(
            verify_telegram(telegram.as_bytes()),
            Err(AdapterError::Protocol(_))
        ));
    }

    #[test]
    fn test_dsmr2_without_crc_accepted() {
        let telegram = format!("{}\r\n", BODY);
        assert!(verify_telegram(telegram.as_bytes()).is_ok());
    }

    #[tokio::test]
    async fn test_read_telegram_skips_partial_prefix() {
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        let stream = format!("0(00.111*kW)\r\n!ABCD\r\n{}", seal(BODY));
        tx.write_all(stream.as_bytes()).await.unwrap();

        let raw = read_telegram(&mut rx).await.unwrap();
        assert!(raw.starts_with(b"/ISk5"));
        assert!(verify_telegram(&raw).is_ok());
    }
}
