//! GridMind device layer.
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `http` | ✅ | Tasmota / Shelly HTTP adapter |
//! | `serial` | ✅ | Real serial ports through `tokio-serial` |
//!
//! ## Architecture
//!
//! - **DeviceRegistry**: known devices and their availability state
//! - **DeviceAdapter**: one implementation per wire protocol
//! - **TelemetryPoller**: periodic concurrent reads through the adapters
//! - **PushListener**: UDP intake for devices that report on their own
//! - **CommandDispatcher**: validated, per-device serialized commands

pub mod adapter;
pub mod adapters;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod listener;
pub mod poller;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use adapter::{
    with_timeout, AdapterError, AdapterResult, AdapterSet, DeviceAdapter, DynAdapter, MockAdapter,
};
#[cfg(feature = "http")]
pub use adapters::HttpAdapter;
pub use adapters::{build_adapters, KasaAdapter, ModbusAdapter, OpticalAdapter, P1Adapter};
pub use config::{
    AdaptersConfig, DiscoveryConfig, HttpAdapterConfig, KasaAdapterConfig, ListenerConfig,
    ModbusAdapterConfig, ModbusEndpoint, ModbusTransport, PollerConfig, SerialMeterConfig,
    StaticDeviceConfig,
};
pub use discovery::{discover_all, parse_ip_range, DiscoveryError, DiscoveryReport, SubnetScanner};
pub use dispatcher::{CommandDispatcher, CommandRecord};
pub use listener::{PushListener, PushMessage};
pub use poller::{PollOutcome, PollSummary, ReadingSink, TelemetryPoller};
pub use registry::{DeviceRegistry, SharedDeviceRegistry};
#[cfg(feature = "serial")]
pub use transport::SystemSerialOpener;
pub use transport::{
    BoxedSerialLink, DuplexOpener, DuplexSerial, Framing, SerialLink, SerialOpener,
    SerialSettings, SharedSerialOpener,
};
