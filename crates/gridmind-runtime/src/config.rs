//! The complete `gridmind.toml` document.
//!
//! ```toml
//! [runtime]
//! timezone_offset_minutes = 60
//!
//! [storage]
//! backend = "redb"
//! path = "data/telemetry.redb"
//!
//! [discovery]
//! subnets = ["192.168.1.0/24"]
//!
//! [[devices]]
//! id = "boiler"
//! device_type = "appliance"
//! protocol = "shelly"
//! host = "192.168.1.40"
//! capabilities = ["switch"]
//! essential = true
//!
//! [optimizer]
//! interval_secs = 30
//!
//! [load_balancing]
//! strategy = "average_trim"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use gridmind_anomaly::AnomalyConfig;
use gridmind_core::config::{
    load_toml, parse_toml, require_positive, ConfigError, LoggingConfig, RuntimeConfig, StorageConfig,
};
use gridmind_core::Protocol;
use gridmind_devices::{
    AdaptersConfig, DiscoveryConfig, ListenerConfig, PollerConfig, StaticDeviceConfig,
};
use gridmind_optimizer::{LoadBalancingConfig, OptimizerConfig};

/// Largest accepted site offset from UTC.
const MAX_OFFSET_MINUTES: i32 = 14 * 60;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
    #[serde(default)]
    pub devices: Vec<StaticDeviceConfig>,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub load_balancing: LoadBalancingConfig,
}

impl GridConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = parse_toml(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.timezone_offset_minutes.abs() > MAX_OFFSET_MINUTES {
            return Err(ConfigError::invalid(
                "runtime.timezone_offset_minutes",
                format!("must be within ±{}", MAX_OFFSET_MINUTES),
            ));
        }
        require_positive("runtime.event_capacity", self.runtime.event_capacity as u64)?;
        require_positive("storage.memory_retention", self.storage.memory_retention as u64)?;
        if self.listener.enabled {
            self.listener
                .bind
                .parse::<std::net::SocketAddr>()
                .map_err(|e| ConfigError::invalid("listener.bind", e.to_string()))?;
        }
        gridmind_devices::config::validate(&self.discovery, &self.poller, &self.adapters, &self.devices)?;
        self.anomaly.validate()?;
        self.optimizer.validate()?;
        self.load_balancing.validate()?;
        Ok(())
    }

    /// Read and command timeouts per protocol, from the adapter sections.
    pub fn protocol_timeouts(&self) -> Vec<(Protocol, Duration)> {
        let ms = Duration::from_millis;
        let a = &self.adapters;
        vec![
            (Protocol::Tasmota, ms(a.http.timeout_ms)),
            (Protocol::Shelly, ms(a.http.timeout_ms)),
            (Protocol::Kasa, ms(a.kasa.timeout_ms)),
            (Protocol::ModbusTcp, ms(a.modbus.tcp_timeout_ms)),
            (Protocol::ModbusRtu, ms(a.modbus.rtu_timeout_ms)),
            (Protocol::Iec62056, ms(a.optical.timeout_ms)),
            (Protocol::DsmrP1, ms(a.p1.timeout_ms)),
        ]
    }
}
