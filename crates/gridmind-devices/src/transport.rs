//! Serial transport abstraction.
//!
//! Modbus RTU, IEC 62056-21 optical heads and DSMR P1 ports all sit behind
//! [`SerialOpener`], so the adapters can be driven by an in-memory duplex
//! pipe in tests and by `tokio-serial` in production.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::adapter::{AdapterError, AdapterResult};

/// Character framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// 8 data bits, no parity, 1 stop bit
    EightN1,
    /// 7 data bits, even parity, 1 stop bit
    SevenE1,
}

/// Serial port parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub framing: Framing,
}

impl SerialSettings {
    pub fn new(baud_rate: u32, framing: Framing) -> Self {
        Self { baud_rate, framing }
    }
}

/// An open serial line.
pub trait SerialLink: AsyncRead + AsyncWrite + Unpin + Send {
    /// Change the baud rate without closing the port.
    fn set_baud_rate(&mut self, baud_rate: u32) -> AdapterResult<()>;
}

pub type BoxedSerialLink = Box<dyn SerialLink>;

/// Opens serial lines and lists candidate ports.
#[async_trait]
pub trait SerialOpener: Send + Sync {
    async fn open(&self, path: &str, settings: SerialSettings) -> AdapterResult<BoxedSerialLink>;

    /// Ports present on this host.
    fn available_ports(&self) -> Vec<String>;
}

pub type SharedSerialOpener = Arc<dyn SerialOpener>;

/// In-memory serial line over a `tokio::io::DuplexStream`.
///
/// Records every baud-rate change so tests can assert on handshakes.
pub struct DuplexSerial {
    stream: tokio::io::DuplexStream,
    baud_changes: Arc<std::sync::Mutex<Vec<u32>>>,
}

impl DuplexSerial {
    pub fn new(stream: tokio::io::DuplexStream) -> Self {
        Self {
            stream,
            baud_changes: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn baud_log(&self) -> Arc<std::sync::Mutex<Vec<u32>>> {
        self.baud_changes.clone()
    }
}

impl AsyncRead for DuplexSerial {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for DuplexSerial {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl SerialLink for DuplexSerial {
    fn set_baud_rate(&mut self, baud_rate: u32) -> AdapterResult<()> {
        self.baud_changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(baud_rate);
        Ok(())
    }
}

/// Opener that hands out pre-wired duplex links, one per `open` call.
#[derive(Default)]
pub struct DuplexOpener {
    links: std::sync::Mutex<std::collections::HashMap<String, Vec<DuplexSerial>>>,
}

impl DuplexOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a link for `path`.
    pub fn push(&self, path: &str, link: DuplexSerial) {
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(path.to_string())
            .or_default()
            .push(link);
    }
}

#[async_trait]
impl SerialOpener for DuplexOpener {
    async fn open(&self, path: &str, _settings: SerialSettings) -> AdapterResult<BoxedSerialLink> {
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        match links.get_mut(path) {
            Some(queue) if !queue.is_empty() => Ok(Box::new(queue.remove(0))),
            _ => Err(AdapterError::Transport(format!("no such port: {}", path))),
        }
    }

    fn available_ports(&self) -> Vec<String> {
        let links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        let mut ports: Vec<String> = links
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(p, _)| p.clone())
            .collect();
        ports.sort();
        ports
    }
}

#[cfg(feature = "serial")]
pub use system::SystemSerialOpener;

#[cfg(feature = "serial")]
mod system {
    use super::*;
    use tokio_serial::{DataBits, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};

    impl SerialLink for SerialStream {
        fn set_baud_rate(&mut self, baud_rate: u32) -> AdapterResult<()> {
            SerialPort::set_baud_rate(self, baud_rate).map_err(AdapterError::transport)
        }
    }

    /// Opens real serial ports through `tokio-serial`.
    #[derive(Debug, Default, Clone)]
    pub struct SystemSerialOpener;

    #[async_trait]
    impl SerialOpener for SystemSerialOpener {
        async fn open(
            &self,
            path: &str,
            settings: SerialSettings,
        ) -> AdapterResult<BoxedSerialLink> {
            let (data_bits, parity) = match settings.framing {
                Framing::EightN1 => (DataBits::Eight, Parity::None),
                Framing::SevenE1 => (DataBits::Seven, Parity::Even),
            };
            let stream = tokio_serial::new(path, settings.baud_rate)
                .data_bits(data_bits)
                .parity(parity)
                .stop_bits(StopBits::One)
                .open_native_async()
                .map_err(|e| AdapterError::Transport(format!("{}: {}", path, e)))?;
            Ok(Box::new(stream))
        }

        fn available_ports(&self) -> Vec<String> {
            match tokio_serial::available_ports() {
                Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
                Err(e) => {
                    tracing::debug!(error = %e, "Serial port enumeration failed");
                    Vec::new()
                }
            }
        }
    }
}
