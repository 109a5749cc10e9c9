//! Protocol adapter interface.
//!
//! Every wire protocol is wrapped in a [`DeviceAdapter`]. Adapters are
//! stateless with respect to the registry: they receive the [`Device`] they
//! should talk to and return normalized [`Reading`]s or typed errors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use gridmind_core::{Device, DeviceCommand, DeviceDescriptor, Error, Protocol, Reading};

/// Result type for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Error type for device adapter operations.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// Socket, serial or HTTP transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or checksum-mismatched payload
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation timeout
    #[error("Operation timeout after {0}ms")]
    Timeout(u64),

    /// Device is offline
    #[error("Device offline: {0}")]
    DeviceOffline(String),

    /// Device refused or cannot perform the command
    #[error("Command rejected: {0}")]
    CommandRejected(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Adapter configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl AdapterError {
    pub fn transport(e: impl std::fmt::Display) -> Self {
        Self::Transport(e.to_string())
    }

    pub fn protocol(e: impl std::fmt::Display) -> Self {
        Self::Protocol(e.to_string())
    }

    /// Whether this failure should count toward the offline threshold.
    pub fn affects_availability(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::DeviceOffline(_)
        )
    }
}

impl From<std::io::Error> for AdapterError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            AdapterError::Timeout(0)
        } else {
            AdapterError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(e: serde_json::Error) -> Self {
        AdapterError::Protocol(format!("invalid JSON: {}", e))
    }
}

impl From<AdapterError> for Error {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::Transport(s) => Error::Transport(s),
            AdapterError::Protocol(s) => Error::Protocol(s),
            AdapterError::Timeout(ms) => Error::Timeout(format!("{}ms", ms)),
            AdapterError::DeviceOffline(s) => Error::DeviceOffline(s),
            AdapterError::CommandRejected(s) => Error::CommandRejected(s),
            AdapterError::DeviceNotFound(s) => Error::NotFound(s),
            AdapterError::Configuration(s) => Error::Config(s),
        }
    }
}

/// Run `fut` under `timeout`, mapping expiry to [`AdapterError::Timeout`].
pub async fn with_timeout<T, F>(timeout: std::time::Duration, fut: F) -> AdapterResult<T>
where
    F: std::future::Future<Output = AdapterResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout(timeout.as_millis() as u64)),
    }
}

/// Device adapter trait.
///
/// One implementation per wire protocol. The registry calls `discover`,
/// the poller calls `read_telemetry`, the dispatcher calls `send_command`.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Adapter name for logs.
    fn name(&self) -> &str;

    /// Protocols this adapter owns.
    fn protocols(&self) -> &[Protocol];

    /// Find reachable devices. Partial failures are logged, not returned.
    async fn discover(&self) -> AdapterResult<Vec<DeviceDescriptor>>;

    /// Read one normalized sample from `device`.
    async fn read_telemetry(&self, device: &Device) -> AdapterResult<Reading>;

    /// Execute `command` on `device`.
    async fn send_command(&self, device: &Device, command: &DeviceCommand) -> AdapterResult<()>;
}

pub type DynAdapter = Arc<dyn DeviceAdapter>;

/// Adapters indexed by the protocol they own.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: Vec<DynAdapter>,
    by_protocol: HashMap<Protocol, DynAdapter>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. A later adapter replaces an earlier one for the
    /// protocols they share.
    pub fn register(&mut self, adapter: DynAdapter) {
        for protocol in adapter.protocols() {
            self.by_protocol.insert(*protocol, adapter.clone());
        }
        self.adapters.push(adapter);
    }

    pub fn with(mut self, adapter: DynAdapter) -> Self {
        self.register(adapter);
        self
    }

    pub fn for_protocol(&self, protocol: Protocol) -> Option<&DynAdapter> {
        self.by_protocol.get(&protocol)
    }

    pub fn all(&self) -> &[DynAdapter] {
        &self.adapters
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Scripted adapter for tests and dry runs.
///
/// Readings are served from a per-device script; once the script is
/// exhausted the last entry repeats. Commands are recorded.
pub struct MockAdapter {
    name: String,
    protocols: Vec<Protocol>,
    discovered: Mutex<Vec<DeviceDescriptor>>,
    scripts: Mutex<HashMap<String, Vec<AdapterResult<f64>>>>,
    command_results: Mutex<HashMap<String, AdapterResult<()>>>,
    commands: Mutex<Vec<(String, DeviceCommand)>>,
    delay: Mutex<Option<std::time::Duration>>,
}

impl MockAdapter {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            name: format!("mock-{}", protocol),
            protocols: vec![protocol],
            discovered: Mutex::new(Vec::new()),
            scripts: Mutex::new(HashMap::new()),
            command_results: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
        }
    }

    fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        m.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_discovered(self, descriptor: DeviceDescriptor) -> Self {
        Self::lock(&self.discovered).push(descriptor);
        self
    }

    /// Script power values (or failures) returned by successive reads.
    pub fn script(&self, device_id: &str, steps: Vec<AdapterResult<f64>>) {
        Self::lock(&self.scripts).insert(device_id.to_string(), steps);
    }

    pub fn set_command_result(&self, device_id: &str, result: AdapterResult<()>) {
        Self::lock(&self.command_results).insert(device_id.to_string(), result);
    }

    /// Delay every call, for timeout tests.
    pub fn set_delay(&self, delay: std::time::Duration) {
        *Self::lock(&self.delay) = Some(delay);
    }

    pub fn sent_commands(&self) -> Vec<(String, DeviceCommand)> {
        Self::lock(&self.commands).clone()
    }

    async fn maybe_delay(&self) {
        let delay = *Self::lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl DeviceAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    async fn discover(&self) -> AdapterResult<Vec<DeviceDescriptor>> {
        Ok(Self::lock(&self.discovered).clone())
    }

    async fn read_telemetry(&self, device: &Device) -> AdapterResult<Reading> {
        self.maybe_delay().await;
        let step = {
            let mut scripts = Self::lock(&self.scripts);
            match scripts.get_mut(&device.id) {
                Some(steps) if steps.len() > 1 => steps.remove(0),
                Some(steps) if steps.len() == 1 => steps[0].clone(),
                _ => return Err(AdapterError::DeviceNotFound(device.id.clone())),
            }
        };
        step.map(|power| Reading::new(device.id.clone(), Utc::now(), power))
    }

    async fn send_command(&self, device: &Device, command: &DeviceCommand) -> AdapterResult<()> {
        self.maybe_delay().await;
        Self::lock(&self.commands).push((device.id.clone(), command.clone()));
        Self::lock(&self.command_results)
            .get(&device.id)
            .cloned()
            .unwrap_or(Ok(()))
    }
}
