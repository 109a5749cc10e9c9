//! Device model shared by every GridMind crate.
//!
//! A [`Device`] is created from a [`DeviceDescriptor`] the first time an
//! adapter discovers it, and from then on only its runtime fields (status,
//! last reading, commanded state) change. Identity and protocol are fixed.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::reading::Reading;

/// Device identifier. Stable across rediscovery.
pub type DeviceId = String;

/// Device category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Switchable outlet
    SmartPlug,
    /// Energy meter (read-only)
    Meter,
    /// Heating, ventilation, air-conditioning
    Hvac,
    /// Dimmable or colored lighting
    Lighting,
    /// Large appliance (washer, boiler, EV charger…)
    Appliance,
    /// Anything else
    Other,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SmartPlug => "smart_plug",
            Self::Meter => "meter",
            Self::Hvac => "hvac",
            Self::Lighting => "lighting",
            Self::Appliance => "appliance",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "smart_plug" | "plug" => Ok(Self::SmartPlug),
            "meter" => Ok(Self::Meter),
            "hvac" | "thermostat" => Ok(Self::Hvac),
            "lighting" | "light" | "dimmer" => Ok(Self::Lighting),
            "appliance" => Ok(Self::Appliance),
            "other" => Ok(Self::Other),
            other => Err(Error::Validation(format!("unknown device type: {}", other))),
        }
    }
}

/// Wire protocol a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Tasmota HTTP/JSON firmware
    Tasmota,
    /// Shelly gen1 HTTP/JSON firmware
    Shelly,
    /// Length-prefixed XOR-ciphered TCP (Kasa-style)
    Kasa,
    /// Modbus over TCP (MBAP header)
    ModbusTcp,
    /// Modbus RTU over a serial line
    ModbusRtu,
    /// IEC 62056-21 optical readout
    Iec62056,
    /// DSMR P1 telegram port
    DsmrP1,
    /// Unsolicited UDP JSON datagrams
    UdpPush,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tasmota => "tasmota",
            Self::Shelly => "shelly",
            Self::Kasa => "kasa",
            Self::ModbusTcp => "modbus_tcp",
            Self::ModbusRtu => "modbus_rtu",
            Self::Iec62056 => "iec62056",
            Self::DsmrP1 => "dsmr_p1",
            Self::UdpPush => "udp_push",
        }
    }

    /// Upper bound for a single read or command round-trip.
    pub fn default_timeout(&self) -> Duration {
        match self {
            Self::Tasmota | Self::Shelly => Duration::from_secs(5),
            Self::Kasa => Duration::from_secs(3),
            Self::ModbusTcp => Duration::from_secs(2),
            Self::ModbusRtu => Duration::from_secs(5),
            Self::Iec62056 | Self::DsmrP1 => Duration::from_secs(10),
            Self::UdpPush => Duration::from_secs(2),
        }
    }

    /// Whether the poller actively reads devices of this protocol.
    pub fn is_polled(&self) -> bool {
        !matches!(self, Self::UdpPush)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a device is reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportAddress {
    /// HTTP endpoint
    Http { host: String, port: u16 },
    /// Raw TCP socket target
    Tcp { host: String, port: u16 },
    /// Serial device path
    Serial { path: String, baud_rate: u32 },
    /// Push-only device, identified by its datagram origin
    Push { origin: String },
}

impl TransportAddress {
    /// `host:port` for socket transports.
    pub fn socket_target(&self) -> Option<String> {
        match self {
            Self::Http { host, port } | Self::Tcp { host, port } => {
                Some(format!("{}:{}", host, port))
            }
            _ => None,
        }
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http { host, port } => write!(f, "http://{}:{}", host, port),
            Self::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Self::Serial { path, baud_rate } => write!(f, "serial://{}@{}", path, baud_rate),
            Self::Push { origin } => write!(f, "udp://{}", origin),
        }
    }
}

/// Something a device can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Produces readings
    Telemetry,
    /// On/off/toggle relay
    Switch,
    /// Brightness 0-100
    Dimmer,
    /// RGB color
    Color,
    /// Thermostat setpoint
    Setpoint,
    /// Active power limit
    PowerLimit,
}

/// Device availability state machine: Discovered → Online ⇄ Offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Discovered,
    Online,
    Offline,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovered => write!(f, "discovered"),
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Last state successfully commanded on a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandedState {
    pub relay_on: Option<bool>,
    pub brightness: Option<u8>,
    pub color: Option<String>,
    pub setpoint_c: Option<f64>,
    pub power_limit_w: Option<f64>,
}

/// What an adapter reports about a device it found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: String,
    pub device_type: DeviceType,
    pub protocol: Protocol,
    pub address: TransportAddress,
    pub capabilities: BTreeSet<Capability>,
    pub max_power_w: Option<f64>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(
        id: impl Into<String>,
        device_type: DeviceType,
        protocol: Protocol,
        address: TransportAddress,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            device_type,
            protocol,
            address,
            capabilities: BTreeSet::from([Capability::Telemetry]),
            max_power_w: None,
            manufacturer: None,
            model: None,
            firmware: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_max_power(mut self, watts: f64) -> Self {
        self.max_power_w = Some(watts);
        self
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_firmware(mut self, firmware: impl Into<String>) -> Self {
        self.firmware = Some(firmware.into());
        self
    }
}

/// A registered device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub device_type: DeviceType,
    pub protocol: Protocol,
    pub address: TransportAddress,
    pub capabilities: BTreeSet<Capability>,
    pub status: DeviceStatus,
    pub last_reading: Option<Reading>,
    pub max_power_w: Option<f64>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
    /// Essential devices are never switched off by the optimizer
    #[serde(default)]
    pub essential: bool,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub commanded: CommandedState,
}

impl Device {
    /// Create a freshly discovered device.
    pub fn from_descriptor(descriptor: DeviceDescriptor) -> Self {
        Self {
            id: descriptor.id,
            name: descriptor.name,
            device_type: descriptor.device_type,
            protocol: descriptor.protocol,
            address: descriptor.address,
            capabilities: descriptor.capabilities,
            status: DeviceStatus::Discovered,
            last_reading: None,
            max_power_w: descriptor.max_power_w,
            manufacturer: descriptor.manufacturer,
            model: descriptor.model,
            firmware: descriptor.firmware,
            essential: false,
            consecutive_failures: 0,
            last_seen: None,
            last_error: None,
            commanded: CommandedState::default(),
        }
    }

    /// Refresh identity metadata from a rediscovery, keeping runtime state.
    pub fn merge_descriptor(&mut self, descriptor: DeviceDescriptor) {
        self.name = descriptor.name;
        self.device_type = descriptor.device_type;
        self.address = descriptor.address;
        self.capabilities = descriptor.capabilities;
        if descriptor.max_power_w.is_some() {
            self.max_power_w = descriptor.max_power_w;
        }
        if descriptor.manufacturer.is_some() {
            self.manufacturer = descriptor.manufacturer;
        }
        if descriptor.model.is_some() {
            self.model = descriptor.model;
        }
        if descriptor.firmware.is_some() {
            self.firmware = descriptor.firmware;
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == DeviceStatus::Online
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Last observed active power, if any.
    pub fn current_power(&self) -> Option<f64> {
        self.last_reading.as_ref().map(|r| r.power_w)
    }

    /// Runtime snapshot handed to external collaborators.
    pub fn state(&self) -> DeviceState {
        DeviceState {
            device_id: self.id.clone(),
            status: self.status,
            last_reading: self.last_reading.clone(),
            last_seen: self.last_seen,
            last_error: self.last_error.clone(),
            consecutive_failures: self.consecutive_failures,
            commanded: self.commanded.clone(),
        }
    }
}

/// Runtime view of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: DeviceId,
    pub status: DeviceStatus,
    pub last_reading: Option<Reading>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub commanded: CommandedState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plug() -> DeviceDescriptor {
        DeviceDescriptor::new(
            "kasa-aabbcc",
            DeviceType::SmartPlug,
            Protocol::Kasa,
            TransportAddress::Tcp {
                host: "192.168.1.20".into(),
                port: 9999,
            },
        )
        .with_capability(Capability::Switch)
    }

    #[test]
    fn test_from_descriptor_starts_discovered() {
        let device = Device::from_descriptor(plug());
        assert_eq!(device.status, DeviceStatus::Discovered);
        assert!(device.supports(Capability::Telemetry));
        assert!(device.supports(Capability::Switch));
        assert!(!device.supports(Capability::Dimmer));
        assert_eq!(device.name, "kasa-aabbcc");
    }

    #[test]
    fn test_merge_keeps_runtime_state() {
        let mut device = Device::from_descriptor(plug());
        device.status = DeviceStatus::Online;
        device.consecutive_failures = 0;
        device.commanded.relay_on = Some(true);

        device.merge_descriptor(plug().with_name("Kitchen").with_firmware("1.5.6"));
        assert_eq!(device.name, "Kitchen");
        assert_eq!(device.firmware.as_deref(), Some("1.5.6"));
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.commanded.relay_on, Some(true));
    }

    #[test]
    fn test_device_type_parse() {
        assert_eq!("plug".parse::<DeviceType>().unwrap(), DeviceType::SmartPlug);
        assert_eq!("HVAC".parse::<DeviceType>().unwrap(), DeviceType::Hvac);
        assert!("toaster".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_address_display() {
        let addr = TransportAddress::Serial {
            path: "/dev/ttyUSB0".into(),
            baud_rate: 300,
        };
        assert_eq!(addr.to_string(), "serial:///dev/ttyUSB0@300");
        assert!(addr.socket_target().is_none());
    }
}
