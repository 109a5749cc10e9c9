//! Configuration sections owned by the device layer.
//!
//! ```toml
//! [discovery]
//! subnets = ["192.168.1.0/24"]
//!
//! [poller]
//! interval_secs = 5
//! failure_threshold = 1
//!
//! [[adapters.modbus.endpoints]]
//! id = "main-meter"
//! transport = "rtu"
//! path = "/dev/ttyUSB0"
//! slave_id = 1
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use gridmind_core::config::{require_positive, ConfigError};
use gridmind_core::{Capability, DeviceDescriptor, DeviceType, Protocol, TransportAddress};

/// `[discovery]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between discovery sweeps
    #[serde(default = "default_discovery_interval")]
    pub interval_secs: u64,

    /// Subnets to sweep: CIDR (`192.168.1.0/24`), range (`10.0.0.1-10.0.0.50`) or single IP
    #[serde(default)]
    pub subnets: Vec<String>,

    /// Concurrent TCP probes during a sweep
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,

    /// Connect timeout per probe in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Also probe every serial port the host reports
    #[serde(default)]
    pub enumerate_serial: bool,
}

fn default_true() -> bool {
    true
}

fn default_discovery_interval() -> u64 {
    300
}

fn default_scan_concurrency() -> usize {
    64
}

fn default_probe_timeout_ms() -> u64 {
    500
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_discovery_interval(),
            subnets: Vec::new(),
            scan_concurrency: default_scan_concurrency(),
            probe_timeout_ms: default_probe_timeout_ms(),
            enumerate_serial: false,
        }
    }
}

impl DiscoveryConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// `[poller]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Tick period in seconds
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,

    /// Offline devices are re-probed every N ticks
    #[serde(default = "default_one")]
    pub offline_retry_ticks: u32,

    /// Consecutive transport failures before a device goes offline
    #[serde(default = "default_one")]
    pub failure_threshold: u32,

    /// Devices polled concurrently
    #[serde(default = "default_poll_concurrency")]
    pub max_concurrency: usize,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_one() -> u32 {
    1
}

fn default_poll_concurrency() -> usize {
    64
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            offline_retry_ticks: 1,
            failure_threshold: 1,
            max_concurrency: default_poll_concurrency(),
        }
    }
}

/// `[listener]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// UDP bind address
    #[serde(default = "default_listener_bind")]
    pub bind: String,
}

fn default_listener_bind() -> String {
    "0.0.0.0:9998".to_string()
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_listener_bind(),
        }
    }
}

/// `[adapters.http]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpAdapterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_http_port")]
    pub port: u16,

    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_http_port() -> u16 {
    80
}

fn default_http_timeout_ms() -> u64 {
    5000
}

impl Default for HttpAdapterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_http_port(),
            timeout_ms: default_http_timeout_ms(),
        }
    }
}

/// `[adapters.kasa]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KasaAdapterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_kasa_port")]
    pub port: u16,

    #[serde(default = "default_kasa_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_kasa_port() -> u16 {
    9999
}

fn default_kasa_timeout_ms() -> u64 {
    3000
}

impl Default for KasaAdapterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_kasa_port(),
            timeout_ms: default_kasa_timeout_ms(),
        }
    }
}

/// Modbus link type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModbusTransport {
    Tcp,
    Rtu,
}

/// One statically configured Modbus slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusEndpoint {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    pub transport: ModbusTransport,

    /// TCP host
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Serial device path for RTU
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default = "default_rtu_baud")]
    pub baud_rate: u32,

    #[serde(default = "default_slave_id")]
    pub slave_id: u8,

    #[serde(default = "default_meter_type")]
    pub device_type: DeviceType,

    /// Relay coil written with function 0x05
    #[serde(default)]
    pub relay_coil: Option<u16>,

    /// Holding register for the active power limit in watts
    #[serde(default)]
    pub power_limit_register: Option<u16>,

    /// Holding register for the setpoint in tenths of °C
    #[serde(default)]
    pub setpoint_register: Option<u16>,

    #[serde(default)]
    pub max_power_w: Option<f64>,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_rtu_baud() -> u32 {
    9600
}

fn default_slave_id() -> u8 {
    1
}

fn default_meter_type() -> DeviceType {
    DeviceType::Meter
}

impl ModbusEndpoint {
    pub fn protocol(&self) -> Protocol {
        match self.transport {
            ModbusTransport::Tcp => Protocol::ModbusTcp,
            ModbusTransport::Rtu => Protocol::ModbusRtu,
        }
    }

    pub fn address(&self) -> Result<TransportAddress, ConfigError> {
        match self.transport {
            ModbusTransport::Tcp => {
                let host = self.host.clone().ok_or_else(|| {
                    ConfigError::invalid(format!("adapters.modbus.{}.host", self.id), "required for tcp")
                })?;
                Ok(TransportAddress::Tcp {
                    host,
                    port: self.port,
                })
            }
            ModbusTransport::Rtu => {
                let path = self.path.clone().ok_or_else(|| {
                    ConfigError::invalid(format!("adapters.modbus.{}.path", self.id), "required for rtu")
                })?;
                Ok(TransportAddress::Serial {
                    path,
                    baud_rate: self.baud_rate,
                })
            }
        }
    }

    pub fn descriptor(&self) -> Result<DeviceDescriptor, ConfigError> {
        let mut descriptor =
            DeviceDescriptor::new(self.id.clone(), self.device_type, self.protocol(), self.address()?)
                .with_manufacturer("modbus");
        if let Some(name) = &self.name {
            descriptor = descriptor.with_name(name.clone());
        }
        if self.relay_coil.is_some() {
            descriptor = descriptor.with_capability(Capability::Switch);
        }
        if self.power_limit_register.is_some() {
            descriptor = descriptor.with_capability(Capability::PowerLimit);
        }
        if self.setpoint_register.is_some() {
            descriptor = descriptor.with_capability(Capability::Setpoint);
        }
        if let Some(max) = self.max_power_w {
            descriptor = descriptor.with_max_power(max);
        }
        Ok(descriptor)
    }
}

/// `[adapters.modbus]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusAdapterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_modbus_tcp_timeout_ms")]
    pub tcp_timeout_ms: u64,

    #[serde(default = "default_modbus_rtu_timeout_ms")]
    pub rtu_timeout_ms: u64,

    #[serde(default)]
    pub endpoints: Vec<ModbusEndpoint>,
}

fn default_modbus_tcp_timeout_ms() -> u64 {
    2000
}

fn default_modbus_rtu_timeout_ms() -> u64 {
    5000
}

impl Default for ModbusAdapterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tcp_timeout_ms: default_modbus_tcp_timeout_ms(),
            rtu_timeout_ms: default_modbus_rtu_timeout_ms(),
            endpoints: Vec::new(),
        }
    }
}

/// `[adapters.optical]` and `[adapters.p1]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialMeterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_serial_timeout_ms")]
    pub timeout_ms: u64,

    /// Ports with a probe or P1 cable attached
    #[serde(default)]
    pub ports: Vec<String>,
}

fn default_serial_timeout_ms() -> u64 {
    10_000
}

impl Default for SerialMeterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: default_serial_timeout_ms(),
            ports: Vec::new(),
        }
    }
}

/// `[adapters]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdaptersConfig {
    #[serde(default)]
    pub http: HttpAdapterConfig,
    #[serde(default)]
    pub kasa: KasaAdapterConfig,
    #[serde(default)]
    pub modbus: ModbusAdapterConfig,
    #[serde(default)]
    pub optical: SerialMeterConfig,
    #[serde(default)]
    pub p1: SerialMeterConfig,
}

/// `[[devices]]`: a device registered without discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticDeviceConfig {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    pub device_type: DeviceType,

    pub protocol: Protocol,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub baud_rate: Option<u32>,

    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,

    /// Never switched off by the optimizer
    #[serde(default)]
    pub essential: bool,

    #[serde(default)]
    pub max_power_w: Option<f64>,
}

impl StaticDeviceConfig {
    pub fn descriptor(&self) -> Result<DeviceDescriptor, ConfigError> {
        let field = |name: &str| format!("devices.{}.{}", self.id, name);
        let host = || {
            self.host
                .clone()
                .ok_or_else(|| ConfigError::invalid(field("host"), "required for network devices"))
        };

        let address = match self.protocol {
            Protocol::Tasmota | Protocol::Shelly => TransportAddress::Http {
                host: host()?,
                port: self.port.unwrap_or(80),
            },
            Protocol::Kasa => TransportAddress::Tcp {
                host: host()?,
                port: self.port.unwrap_or(9999),
            },
            Protocol::ModbusTcp => TransportAddress::Tcp {
                host: host()?,
                port: self.port.unwrap_or(502),
            },
            Protocol::ModbusRtu | Protocol::Iec62056 | Protocol::DsmrP1 => {
                let path = self
                    .path
                    .clone()
                    .ok_or_else(|| ConfigError::invalid(field("path"), "required for serial devices"))?;
                let default_baud = match self.protocol {
                    Protocol::Iec62056 => crate::protocol::iec62056::INITIAL_BAUD,
                    Protocol::DsmrP1 => crate::protocol::dsmr::P1_BAUD,
                    _ => 9600,
                };
                TransportAddress::Serial {
                    path,
                    baud_rate: self.baud_rate.unwrap_or(default_baud),
                }
            }
            Protocol::UdpPush => TransportAddress::Push {
                origin: self.host.clone().unwrap_or_default(),
            },
        };

        let mut descriptor = DeviceDescriptor::new(self.id.clone(), self.device_type, self.protocol, address);
        descriptor.capabilities.extend(self.capabilities.iter().copied());
        if let Some(name) = &self.name {
            descriptor = descriptor.with_name(name.clone());
        }
        if let Some(max) = self.max_power_w {
            descriptor = descriptor.with_max_power(max);
        }
        Ok(descriptor)
    }
}

/// Validate the device-layer sections.
pub fn validate(
    discovery: &DiscoveryConfig,
    poller: &PollerConfig,
    adapters: &AdaptersConfig,
    devices: &[StaticDeviceConfig],
) -> Result<(), ConfigError> {
    require_positive("discovery.interval_secs", discovery.interval_secs)?;
    require_positive("poller.interval_secs", poller.interval_secs)?;
    require_positive("poller.offline_retry_ticks", poller.offline_retry_ticks as u64)?;
    require_positive("poller.failure_threshold", poller.failure_threshold as u64)?;
    for subnet in &discovery.subnets {
        crate::discovery::parse_ip_range(subnet)
            .map_err(|e| ConfigError::invalid("discovery.subnets", e.to_string()))?;
    }

    let mut ids = std::collections::HashSet::new();
    for endpoint in &adapters.modbus.endpoints {
        endpoint.address()?;
        if !ids.insert(endpoint.id.clone()) {
            return Err(ConfigError::invalid("adapters.modbus.endpoints", format!("duplicate id {}", endpoint.id)));
        }
    }
    for device in devices {
        device.descriptor()?;
        if !ids.insert(device.id.clone()) {
            return Err(ConfigError::invalid("devices", format!("duplicate id {}", device.id)));
        }
    }
    Ok(())
}
