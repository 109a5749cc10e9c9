//! Rolling XOR stream cipher used by Kasa-style smart plugs.
//!
//! The key starts at 171. Each plaintext byte is XORed with the key and the
//! resulting ciphertext byte becomes the next key. On the wire every message
//! is prefixed with its ciphertext length as a big-endian `u32`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::adapter::{AdapterError, AdapterResult};

/// Initial key.
pub const INITIAL_KEY: u8 = 171;

/// Largest response accepted from a device.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

pub fn encrypt(plain: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    plain
        .iter()
        .map(|&b| {
            let c = b ^ key;
            key = c;
            c
        })
        .collect()
}

pub fn decrypt(cipher: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    cipher
        .iter()
        .map(|&c| {
            let b = c ^ key;
            key = c;
            b
        })
        .collect()
}

/// Encrypt and prepend the 4-byte length header.
pub fn encode_frame(plain: &[u8]) -> Vec<u8> {
    let body = encrypt(plain);
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Decode a complete length-prefixed frame.
pub fn decode_frame(frame: &[u8]) -> AdapterResult<Vec<u8>> {
    if frame.len() < 4 {
        return Err(AdapterError::protocol("frame shorter than length header"));
    }
    let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let body = &frame[4..];
    if body.len() != len {
        return Err(AdapterError::Protocol(format!(
            "length header says {} bytes, got {}",
            len,
            body.len()
        )));
    }
    Ok(decrypt(body))
}

/// Write one encrypted frame to `io`.
pub async fn write_message<W>(io: &mut W, plain: &[u8]) -> AdapterResult<()>
where
    W: AsyncWrite + Unpin,
{
    io.write_all(&encode_frame(plain)).await?;
    io.flush().await?;
    Ok(())
}

/// Read one encrypted frame from `io` and return the plaintext.
pub async fn read_message<R>(io: &mut R) -> AdapterResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    io.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(AdapterError::Protocol(format!(
            "message of {} bytes exceeds limit",
            len
        )));
    }
    let mut body = vec![0u8; len];
    io.read_exact(&mut body).await?;
    Ok(decrypt(&body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_known_ciphertext() {
        // {"system":{"get_sysinfo":{}}}
        let cipher = encrypt(br#"{"system":{"get_sysinfo":{}}}"#);
        assert_eq!(&cipher[..4], &[0xD0, 0xF2, 0x81, 0xF8]);
    }

    #[test]
    fn test_roundtrip_arbitrary_json() {
        let mut rng = rand::thread_rng();
        for len in [0usize, 1, 2, 17, 255, 1024, 4096] {
            let payload = serde_json::json!({
                "emeter": {"get_realtime": {}},
                "pad": (0..len).map(|_| rng.gen_range(b'a'..=b'z') as char).collect::<String>(),
            })
            .to_string();
            let frame = encode_frame(payload.as_bytes());
            assert_eq!(frame.len(), payload.len() + 4);
            assert_eq!(decode_frame(&frame).unwrap(), payload.as_bytes());
        }
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let mut frame = encode_frame(b"{\"a\":1}");
        frame.pop();
        assert!(matches!(decode_frame(&frame), Err(AdapterError::Protocol(_))));
        assert!(decode_frame(&[0, 0]).is_err());
    }

    #[tokio::test]
    async fn test_stream_io() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_message(&mut a, br#"{"ok":true}"#).await.unwrap();
        let got = read_message(&mut b).await.unwrap();
        assert_eq!(got, br#"{"ok":true}"#);
    }
}
