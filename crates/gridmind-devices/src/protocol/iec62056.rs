//! IEC 62056-21 mode C readout over an optical probe.
//!
//! Sequence: send `/?!\r\n` at 300 baud 7E1; the meter answers with its
//! identification `/XXXZ<ident>\r\n` where `Z` (5th character) encodes the
//! baud rate it can switch to; acknowledge with `ACK 0 Z 0 CR LF` to request
//! a data readout, switch the port to that rate, then read
//! `STX <data lines> ! CR LF ETX BCC`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::adapter::{AdapterError, AdapterResult};
use crate::transport::SerialLink;

pub const REQUEST: &[u8] = b"/?!\r\n";
pub const INITIAL_BAUD: u32 = 300;

const ACK: u8 = 0x06;
const STX: u8 = 0x02;
const ETX: u8 = 0x03;

/// Largest readout accepted.
const MAX_READOUT: usize = 16 * 1024;

/// Baud rate for a mode C identification character.
pub fn baud_for_code(code: char) -> Option<u32> {
    match code {
        '0' => Some(300),
        '1' => Some(600),
        '2' => Some(1200),
        '3' => Some(2400),
        '4' => Some(4800),
        '5' => Some(9600),
        '6' => Some(19200),
        _ => None,
    }
}

/// Parsed identification message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification {
    /// Three-letter manufacturer code
    pub manufacturer: String,
    pub baud_code: char,
    pub baud_rate: u32,
    /// Remainder of the line, model and serial
    pub ident: String,
}

/// Parse the meter's reply to the sign-on request.
pub fn parse_identification(line: &str) -> AdapterResult<Identification> {
    let line = line.trim_end_matches(['\r', '\n']);
    if !line.starts_with('/') {
        return Err(AdapterError::Protocol(format!(
            "identification must start with '/': {:?}",
            line
        )));
    }
    let chars: Vec<char> = line.chars().collect();
    if chars.len() < 5 {
        return Err(AdapterError::protocol("identification too short"));
    }
    let baud_code = chars[4];
    let baud_rate = baud_for_code(baud_code).ok_or_else(|| {
        AdapterError::Protocol(format!("unsupported baud rate code {:?}", baud_code))
    })?;
    Ok(Identification {
        manufacturer: chars[1..4].iter().collect(),
        baud_code,
        baud_rate,
        ident: chars[5..].iter().collect(),
    })
}

/// `ACK 0 Z 0 CR LF`: protocol mode C, baud code Z, data readout.
pub fn ack_message(baud_code: char) -> Vec<u8> {
    let mut msg = vec![ACK, b'0'];
    msg.push(baud_code as u8);
    msg.extend_from_slice(b"0\r\n");
    msg
}

/// Block check character: XOR of every byte after STX up to and including ETX.
pub fn bcc(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Frame `body` as `STX body ETX BCC`, the way a meter sends it.
pub fn encode_data_block(body: &str) -> Vec<u8> {
    let mut block = body.as_bytes().to_vec();
    block.push(ETX);
    let check = bcc(&block);
    let mut framed = Vec::with_capacity(block.len() + 2);
    framed.push(STX);
    framed.extend_from_slice(&block);
    framed.push(check);
    framed
}

/// Extract the data block from a raw readout and verify its BCC when present.
///
/// `raw` is everything received after the identification line.
pub fn extract_data_block(raw: &[u8]) -> AdapterResult<String> {
    let start = raw.iter().position(|&b| b == STX).map(|p| p + 1).unwrap_or(0);
    let body = &raw[start..];

    let text_end = match body.iter().position(|&b| b == ETX) {
        Some(etx) => {
            if let Some(&expected) = body.get(etx + 1) {
                let actual = bcc(&body[..=etx]);
                if actual != expected {
                    return Err(AdapterError::Protocol(format!(
                        "BCC mismatch: expected 0x{:02X}, computed 0x{:02X}",
                        expected, actual
                    )));
                }
            }
            etx
        }
        None => body.len(),
    };

    let text = std::str::from_utf8(&body[..text_end])
        .map_err(|_| AdapterError::protocol("readout is not ASCII"))?;
    if !text.contains('!') {
        return Err(AdapterError::protocol("readout missing '!' terminator"));
    }
    Ok(text.to_string())
}

/// Result of a complete readout session.
#[derive(Debug, Clone)]
pub struct Readout {
    pub identification: Identification,
    /// Data block text, lines up to and including `!`
    pub data: String,
}

/// Read one CR LF terminated line byte by byte, leaving the rest unread.
async fn read_line<R>(io: &mut R) -> AdapterResult<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if io.read(&mut byte).await? == 0 {
            if line.is_empty() {
                return Err(AdapterError::Transport("no answer to sign-on".into()));
            }
            break;
        }
        line.push(byte[0]);
        if byte[0] == b'\n' || line.len() > 128 {
            break;
        }
    }
    String::from_utf8(line).map_err(|_| AdapterError::protocol("identification is not ASCII"))
}

/// Run the sign-on, baud switch and readout on an open 300 baud link.
pub async fn read_out<L>(link: &mut L) -> AdapterResult<Readout>
where
    L: SerialLink + ?Sized,
{
    link.write_all(REQUEST).await?;
    link.flush().await?;

    let line = read_line(link).await?;
    let identification = parse_identification(&line)?;

    link.write_all(&ack_message(identification.baud_code)).await?;
    link.flush().await?;
    link.set_baud_rate(identification.baud_rate)?;

    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = link.read(&mut byte).await?;
        if n == 0 {
            break;
        }
        raw.push(byte[0]);
        if raw.len() > MAX_READOUT {
            return Err(AdapterError::protocol("readout exceeds size limit"));
        }
        // ETX followed by its BCC ends the telegram
        if raw.len() >= 2 && raw[raw.len() - 2] == ETX {
            break;
        }
    }

    let data = extract_data_block(&raw)?;
    Ok(Readout {
        identification,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DuplexSerial;

    #[test]
    fn test_identification_baud_code() {
        let id = parse_identification("/ISk5MT174-0001\r\n").unwrap();
        assert_eq!(id.manufacturer, "ISk");
        assert_eq!(id.baud_code, '5');
        assert_eq!(id.baud_rate, 9600);
        assert_eq!(id.ident, "MT174-0001");

        assert!(parse_identification("ISk5MT174").is_err());
        assert!(parse_identification("/ISk9MT174").is_err());
    }

    #[test]
    fn test_ack_message() {
        assert_eq!(ack_message('5'), vec![0x06, b'0', b'5', b'0', b'\r', b'\n']);
    }

    #[test]
    fn test_bcc_verification() {
        let mut raw = encode_data_block("1.8.0(000123.4*kWh)\r\n!\r\n");
        assert!(extract_data_block(&raw).unwrap().contains("1.8.0"));

        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        assert!(matches!(extract_data_block(&raw), Err(AdapterError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_full_session_over_duplex() {
        let (host, mut meter) = tokio::io::duplex(1024);
        let mut link = DuplexSerial::new(host);
        let bauds = link.baud_log();

        let meter_task = tokio::spawn(async move {
            let mut req = [0u8; 5];
            meter.read_exact(&mut req).await.unwrap();
            assert_eq!(&req, REQUEST);
            meter.write_all(b"/LGZ4ZMD3104100\r\n").await.unwrap();

            let mut ack = [0u8; 6];
            meter.read_exact(&mut ack).await.unwrap();
            assert_eq!(ack, [0x06, b'0', b'4', b'0', b'\r', b'\n']);

            let body = "16.7.0(0.412*kW)\r\n32.7.0(231.2*V)\r\n1.8.0(004711.0*kWh)\r\n!\r\n";
            meter.write_all(&encode_data_block(body)).await.unwrap();
        });

        let readout = read_out(&mut link).await.unwrap();
        meter_task.await.unwrap();

        assert_eq!(readout.identification.baud_rate, 4800);
        assert!(readout.data.contains("16.7.0(0.412*kW)"));
        assert_eq!(*bauds.lock().unwrap(), vec![4800]);
    }
}
