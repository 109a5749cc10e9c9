//! IEC 62056-21 optical probe adapter.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use gridmind_core::{Device, DeviceCommand, DeviceDescriptor, DeviceType, Protocol, Reading, TransportAddress};

use crate::adapter::{with_timeout, AdapterError, AdapterResult, DeviceAdapter};
use crate::config::SerialMeterConfig;
use crate::protocol::iec62056::{self, Readout};
use crate::protocol::obis::ObisReadout;
use crate::transport::{Framing, SerialSettings, SharedSerialOpener};

/// Reads utility meters through an optical head.
pub struct OpticalAdapter {
    ports: Vec<String>,
    enumerate: bool,
    timeout: Duration,
    opener: SharedSerialOpener,
}

impl OpticalAdapter {
    pub fn new(config: &SerialMeterConfig, opener: SharedSerialOpener) -> Self {
        Self {
            ports: config.ports.clone(),
            enumerate: false,
            timeout: Duration::from_millis(config.timeout_ms),
            opener,
        }
    }

    /// Also probe every port the opener reports.
    pub fn with_enumeration(mut self, enabled: bool) -> Self {
        self.enumerate = enabled;
        self
    }

    async fn session(&self, path: &str) -> AdapterResult<Readout> {
        with_timeout(self.timeout, async {
            let settings = SerialSettings::new(iec62056::INITIAL_BAUD, Framing::SevenE1);
            let mut link = self.opener.open(path, settings).await?;
            iec62056::read_out(link.as_mut()).await
        })
        .await
    }

    fn candidate_ports(&self) -> Vec<String> {
        let mut ports = self.ports.clone();
        if self.enumerate {
            ports.extend(self.opener.available_ports());
        }
        ports.sort();
        ports.dedup();
        ports
    }
}

/// Stable id from the identification line: `/LGZ4ZMD3104100` → `iec-lgz-zmd3104100`.
pub fn meter_id(manufacturer: &str, ident: &str) -> String {
    let ident: String = ident
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    format!("iec-{}-{}", manufacturer.to_ascii_lowercase(), ident)
}

#[async_trait]
impl DeviceAdapter for OpticalAdapter {
    fn name(&self) -> &str {
        "optical"
    }

    fn protocols(&self) -> &[Protocol] {
        &[Protocol::Iec62056]
    }

    async fn discover(&self) -> AdapterResult<Vec<DeviceDescriptor>> {
        let mut found = Vec::new();
        for path in self.candidate_ports() {
            match self.session(&path).await {
                Ok(readout) => {
                    let id = &readout.identification;
                    let descriptor = DeviceDescriptor::new(
                        meter_id(&id.manufacturer, &id.ident),
                        DeviceType::Meter,
                        Protocol::Iec62056,
                        TransportAddress::Serial {
                            path: path.clone(),
                            baud_rate: iec62056::INITIAL_BAUD,
                        },
                    )
                    .with_manufacturer(id.manufacturer.clone())
                    .with_model(id.ident.clone());
                    found.push(descriptor);
                }
                Err(e) => {
                    tracing::debug!(category = "discovery", port = %path, error = %e, "No IEC 62056-21 meter")
                }
            }
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
        let readout = self.session(path).await?;
        ObisReadout::parse(&readout.data).to_reading(&device.id, Utc::now())
    }

    async fn send_command(&self, device: &Device, command: &DeviceCommand) -> AdapterResult<()> {
        Err(AdapterError::CommandRejected(format!(
            "{} is read-only, cannot {}",
            device.id,
            command.action_name()
        )))
    }
}
