//! Modbus energy meters and controllers, RTU or TCP.
//!
//! Endpoints are configured statically; discovery reports them as-is.
//! Slaves sharing one RTU bus are polled one at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use gridmind_core::{Device, DeviceCommand, DeviceDescriptor, Protocol, Reading};

use crate::adapter::{with_timeout, AdapterError, AdapterResult, DeviceAdapter};
use crate::config::{ModbusAdapterConfig, ModbusEndpoint, ModbusTransport};
use crate::protocol::modbus::{self, MeterValues, Request, Response};
use crate::transport::{Framing, SerialSettings, SharedSerialOpener};

/// Adapter for statically configured Modbus slaves.
pub struct ModbusAdapter {
    endpoints: HashMap<String, ModbusEndpoint>,
    tcp_timeout: Duration,
    rtu_timeout: Duration,
    opener: SharedSerialOpener,
    transaction_id: AtomicU16,
    bus_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ModbusAdapter {
    pub fn new(config: &ModbusAdapterConfig, opener: SharedSerialOpener) -> Self {
        Self {
            endpoints: config
                .endpoints
                .iter()
                .map(|e| (e.id.clone(), e.clone()))
                .collect(),
            tcp_timeout: Duration::from_millis(config.tcp_timeout_ms),
            rtu_timeout: Duration::from_millis(config.rtu_timeout_ms),
            opener,
            transaction_id: AtomicU16::new(1),
            bus_locks: DashMap::new(),
        }
    }

    fn endpoint(&self, device: &Device) -> AdapterResult<&ModbusEndpoint> {
        self.endpoints
            .get(&device.id)
            .ok_or_else(|| AdapterError::DeviceNotFound(format!("no Modbus endpoint for {}", device.id)))
    }

    async fn transact(&self, endpoint: &ModbusEndpoint, request: Request) -> AdapterResult<Response> {
        match endpoint.transport {
            ModbusTransport::Tcp => {
                let host = endpoint
                    .host
                    .as_deref()
                    .ok_or_else(|| AdapterError::Configuration(format!("{} has no host", endpoint.id)))?;
                let target = format!("{}:{}", host, endpoint.port);
                let tid = self.transaction_id.fetch_add(1, Ordering::Relaxed);
                with_timeout(self.tcp_timeout, async {
                    let mut stream = TcpStream::connect(&target)
                        .await
                        .map_err(|e| AdapterError::Transport(format!("{}: {}", target, e)))?;
                    modbus::tcp_transact(&mut stream, tid, endpoint.slave_id, &request).await
                })
                .await
            }
            ModbusTransport::Rtu => {
                let path = endpoint
                    .path
                    .clone()
                    .ok_or_else(|| AdapterError::Configuration(format!("{} has no path", endpoint.id)))?;
                let bus = self
                    .bus_locks
                    .entry(path.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone();
                let _guard = bus.lock().await;

                let settings = SerialSettings::new(endpoint.baud_rate, Framing::EightN1);
                with_timeout(self.rtu_timeout, async {
                    let mut link = self.opener.open(&path, settings).await?;
                    modbus::rtu_transact(&mut link, endpoint.slave_id, &request).await
                })
                .await
            }
        }
    }
}

/// Build a reading from a decoded meter block.
pub fn meter_reading(device_id: &str, values: &MeterValues) -> Reading {
    let mut reading = Reading::new(device_id, Utc::now(), values.total_power_w)
        .with_current(values.current())
        .with_energy(values.import_kwh)
        .with_frequency(values.frequency_hz)
        .with_power_factor(values.power_factor.abs());
    let volts = values.voltage();
    if volts > 0.0 {
        reading = reading.with_voltage(volts);
    }
    reading
}

#[async_trait]
impl DeviceAdapter for ModbusAdapter {
    fn name(&self) -> &str {
        "modbus"
    }

    fn protocols(&self) -> &[Protocol] {
        &[Protocol::ModbusTcp, Protocol::ModbusRtu]
    }

    async fn discover(&self) -> AdapterResult<Vec<DeviceDescriptor>> {
        let mut found = Vec::with_capacity(self.endpoints.len());
        for endpoint in self.endpoints.values() {
            match endpoint.descriptor() {
                Ok(descriptor) => found.push(descriptor),
                Err(e) => tracing::warn!(category = "discovery", endpoint = %endpoint.id, error = %e, "Skipping Modbus endpoint"),
            }
        }
        Ok(found)
    }

    async fn read_telemetry(&self, device: &Device) -> AdapterResult<Reading> {
        let endpoint = self.endpoint(device)?;
        match self.transact(endpoint, modbus::meter_block()).await? {
            Response::Registers(registers) => {
                let values = MeterValues::from_registers(&registers)?;
                Ok(meter_reading(&device.id, &values))
            }
            Response::Written { .. } => Err(AdapterError::protocol("unexpected write echo")),
        }
    }

    async fn send_command(&self, device: &Device, command: &DeviceCommand) -> AdapterResult<()> {
        let endpoint = self.endpoint(device)?;
        let unsupported = || {
            AdapterError::CommandRejected(format!(
                "{} has no register for {}",
                endpoint.id,
                command.action_name()
            ))
        };

        let request = match command {
            DeviceCommand::TurnOn | DeviceCommand::TurnOff | DeviceCommand::Toggle => {
                let coil = endpoint.relay_coil.ok_or_else(unsupported)?;
                let on = match command {
                    DeviceCommand::TurnOn => true,
                    DeviceCommand::TurnOff => false,
                    _ => match device.commanded.relay_on {
                        Some(state) => !state,
                        None => {
                            return Err(AdapterError::CommandRejected(
                                "relay state unknown, send turn_on or turn_off first".into(),
                            ))
                        }
                    },
                };
                Request::WriteSingleCoil { address: coil, on }
            }
            DeviceCommand::SetPowerLimit { watts } => Request::WriteSingleRegister {
                address: endpoint.power_limit_register.ok_or_else(unsupported)?,
                value: watts.round().clamp(0.0, u16::MAX as f64) as u16,
            },
            DeviceCommand::SetSetpoint { celsius } => Request::WriteSingleRegister {
                address: endpoint.setpoint_register.ok_or_else(unsupported)?,
                value: (celsius * 10.0).round().clamp(0.0, u16::MAX as f64) as u16,
            },
            _ => return Err(unsupported()),
        };

        match self.transact(endpoint, request).await? {
            Response::Written { .. } => Ok(()),
            Response::Registers(_) => Err(AdapterError::protocol("unexpected register payload")),
        }
    }
}
