//! DSMR P1 port adapter.
//!
//! The meter pushes a telegram every few seconds; a read waits for the next
//! complete one and verifies its CRC before parsing.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use gridmind_core::{Device, DeviceCommand, DeviceDescriptor, DeviceType, Protocol, Reading, TransportAddress};

use crate::adapter::{with_timeout, AdapterError, AdapterResult, DeviceAdapter};
use crate::config::SerialMeterConfig;
use crate::protocol::dsmr;
use crate::protocol::obis::{ObisLine, ObisReadout};
use crate::transport::{Framing, SerialSettings, SharedSerialOpener};

pub struct P1Adapter {
    ports: Vec<String>,
    enumerate: bool,
    timeout: Duration,
    opener: SharedSerialOpener,
}

impl P1Adapter {
    pub fn new(config: &SerialMeterConfig, opener: SharedSerialOpener) -> Self {
        Self {
            ports: config.ports.clone(),
            enumerate: false,
            timeout: Duration::from_millis(config.timeout_ms),
            opener,
        }
    }

    pub fn with_enumeration(mut self, enabled: bool) -> Self {
        self.enumerate = enabled;
        self
    }

    async fn next_telegram(&self, path: &str) -> AdapterResult<String> {
        with_timeout(self.timeout, async {
            let settings = SerialSettings::new(dsmr::P1_BAUD, Framing::EightN1);
            let mut link = self.opener.open(path, settings).await?;
            let raw = dsmr::read_telegram(link.as_mut()).await?;
            dsmr::verify_telegram(&raw)
        })
        .await
    }
}

/// Equipment identifier (`0-0:96.1.1`, hex-encoded ASCII), falling back to
/// the header line.
pub fn equipment_id(telegram: &str) -> Option<String> {
    let from_register = telegram
        .lines()
        .filter_map(ObisLine::parse)
        .find(|line| line.short_code == "96.1.1")
        .map(|line| decode_hex_ascii(&line.raw_value).unwrap_or(line.raw_value));
    let raw = from_register.or_else(|| {
        telegram
            .lines()
            .find_map(|l| l.trim().strip_prefix('/'))
            .map(str::to_string)
    })?;
    let id: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if id.is_empty() {
        None
    } else {
        Some(format!("p1-{}", id))
    }
}

fn decode_hex_ascii(hex: &str) -> Option<String> {
    if hex.len() % 2 != 0 || hex.is_empty() {
        return None;
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok().filter(|s| s.chars().all(|c| c.is_ascii_graphic()))
}

#[async_trait]
impl DeviceAdapter for P1Adapter {
    fn name(&self) -> &str {
        "p1"
    }

    fn protocols(&self) -> &[Protocol] {
        &[Protocol::DsmrP1]
    }

    async fn discover(&self) -> AdapterResult<Vec<DeviceDescriptor>> {
        let mut ports = self.ports.clone();
        if self.enumerate {
            ports.extend(self.opener.available_ports());
        }
        ports.sort();
        ports.dedup();

        let mut found = Vec::new();
        for path in ports {
            let telegram = match self.next_telegram(&path).await {
                Ok(t) => t,
                Err(e) => {
                    tracing::debug!(category = "discovery", port = %path, error = %e, "No P1 telegram");
                    continue;
                }
            };
            let Some(id) = equipment_id(&telegram) else {
                continue;
            };
            let header = ObisReadout::parse(&telegram).identification;
            let mut descriptor = DeviceDescriptor::new(
                id,
                DeviceType::Meter,
                Protocol::DsmrP1,
                TransportAddress::Serial {
                    path: path.clone(),
                    baud_rate: dsmr::P1_BAUD,
                },
            )
            .with_name(format!("P1 meter {}", path));
            if let Some(header) = header {
                descriptor = descriptor.with_model(header);
            }
            found.push(descriptor);
        }
        Ok(found)
    }

    async fn read_telemetry(&self, device: &Device) -> AdapterResult<Reading> {
        let path = match &device.address {
            TransportAddress::Serial { path, .. } => path,
            other => {
                return Err(AdapterError::Configuration(format!(
                    "{} is not a serial address",
                    other
                )))
            }
        };
        let telegram = self.next_telegram(path).await?;
        ObisReadout::parse(&telegram).to_reading(&device.id, Utc::now())
    }

    async fn send_command(&self, device: &Device, command: &DeviceCommand) -> AdapterResult<()> {
        Err(AdapterError::CommandRejected(format!(
            "{} is read-only, cannot {}",
            device.id,
            command.action_name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DuplexOpener, DuplexSerial};
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    const BODY: &str = "/ISk5\\2MT382-1000\r\n\r\n\
        1-3:0.2.8(50)\r\n\
        0-0:96.1.1(4B384547303034303436333935353037)\r\n\
        1-0:1.8.1(000123.456*kWh)\r\n\
        1-0:1.8.2(000100.000*kWh)\r\n\
        1-0:1.7.0(01.193*kW)\r\n\
        1-0:2.7.0(00.193*kW)\r\n\
        1-0:32.7.0(230.1*V)\r\n\
        !";

    #[test]
    fn test_equipment_id_decoded() {
        assert_eq!(equipment_id(BODY).as_deref(), Some("p1-k8eg004046395507"));
        assert_eq!(
            equipment_id("/KFM5KAIFA-METER\r\n\r\n1-0:1.7.0(00.1*kW)\r\n!").as_deref(),
            Some("p1-kfm5kaifameter")
        );
    }

    #[tokio::test]
    async fn test_read_verified_telegram() {
        let opener = Arc::new(DuplexOpener::new());
        let (host, mut meter) = tokio::io::duplex(4096);
        opener.push("/dev/ttyAMA0", DuplexSerial::new(host));
        tokio::spawn(async move {
            meter.write_all(dsmr::seal(BODY).as_bytes()).await.unwrap();
        });

        let adapter = P1Adapter::new(
            &SerialMeterConfig {
                ports: vec!["/dev/ttyAMA0".into()],
                timeout_ms: 1000,
                ..Default::default()
            },
            opener,
        );
        let device = Device::from_descriptor(DeviceDescriptor::new(
            "p1-main",
            DeviceType::Meter,
            Protocol::DsmrP1,
            TransportAddress::Serial {
                path: "/dev/ttyAMA0".into(),
                baud_rate: dsmr::P1_BAUD,
            },
        ));

        let reading = adapter.read_telemetry(&device).await.unwrap();
        assert!((reading.power_w - 1000.0).abs() < 1e-6);
        assert!((reading.energy_kwh - 223.456).abs() < 1e-6);
        assert_eq!(reading.voltage_v, 230.1);
    }

    #[tokio::test]
    async fn test_corrupted_telegram_is_protocol_error() {
        let opener = Arc::new(DuplexOpener::new());
        let (host, mut meter) = tokio::io::duplex(4096);
        opener.push("/dev/ttyAMA0", DuplexSerial::new(host));
        tokio::spawn(async move {
            let corrupted = dsmr::seal(BODY).replace("01.193", "09.193");
            meter.write_all(corrupted.as_bytes()).await.unwrap();
        });

        let adapter = P1Adapter::new(&SerialMeterConfig::default(), opener);
        let device = Device::from_descriptor(DeviceDescriptor::new(
            "p1-main",
            DeviceType::Meter,
            Protocol::DsmrP1,
            TransportAddress::Serial {
                path: "/dev/ttyAMA0".into(),
                baud_rate: dsmr::P1_BAUD,
            },
        ));
        let err = adapter.read_telemetry(&device).await.unwrap_err();
        assert!(matches!(err, AdapterError::Protocol(_)));
        assert!(!err.affects_availability());
    }
}
