//! Command dispatcher.
//!
//! Resolves the target device, checks it is online and capable, validates
//! the parameters, and hands the command to the owning adapter. Commands to
//! one device are serialized; different devices proceed in parallel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use gridmind_core::{
    CommandedState, DeviceCommand, DeviceState, Error, GridEvent, Protocol, Result, SharedEventBus,
};

use crate::adapter::{with_timeout, AdapterError, AdapterSet};
use crate::registry::SharedDeviceRegistry;

/// Commands remembered per device.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// One dispatched command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub device_id: String,
    pub command: DeviceCommand,
    pub issued_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

pub struct CommandDispatcher {
    registry: SharedDeviceRegistry,
    adapters: AdapterSet,
    bus: SharedEventBus,
    locks: DashMap<String, Arc<Mutex<()>>>,
    history: DashMap<String, VecDeque<CommandRecord>>,
    history_limit: usize,
    timeouts: HashMap<Protocol, Duration>,
}

/// Fold a successful command into the commanded state.
pub fn apply_command(state: &mut CommandedState, command: &DeviceCommand) {
    match command {
        DeviceCommand::TurnOn => state.relay_on = Some(true),
        DeviceCommand::TurnOff => state.relay_on = Some(false),
        DeviceCommand::Toggle => state.relay_on = state.relay_on.map(|on| !on),
        DeviceCommand::SetBrightness { level } => state.brightness = Some(*level),
        DeviceCommand::SetColor { hex } => {
            state.color = Some(hex.trim_start_matches('#').to_ascii_uppercase())
        }
        DeviceCommand::SetSetpoint { celsius } => state.setpoint_c = Some(*celsius),
        DeviceCommand::SetPowerLimit { watts } => state.power_limit_w = Some(*watts),
    }
}

impl CommandDispatcher {
    pub fn new(registry: SharedDeviceRegistry, adapters: AdapterSet, bus: SharedEventBus) -> Self {
        Self {
            registry,
            adapters,
            bus,
            locks: DashMap::new(),
            history: DashMap::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            timeouts: HashMap::new(),
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn with_timeout(mut self, protocol: Protocol, timeout: Duration) -> Self {
        self.timeouts.insert(protocol, timeout);
        self
    }

    fn device_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Execute `command` on `device_id` and return the post-command state.
    pub async fn send_command(&self, device_id: &str, command: DeviceCommand) -> Result<DeviceState> {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;
        let started = tokio::time::Instant::now();

        let result = self.execute(device_id, &command).await;

        let error = result.as_ref().err().map(|e| e.to_string());
        self.remember(CommandRecord {
            device_id: device_id.to_string(),
            command: command.clone(),
            issued_at: Utc::now(),
            success: result.is_ok(),
            error: error.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        self.bus.publish(
            GridEvent::CommandCompleted {
                device_id: device_id.to_string(),
                action: command.action_name().to_string(),
                success: result.is_ok(),
                error: error.clone(),
            },
            "dispatcher",
        );

        match &error {
            None => tracing::info!(category = "command", device_id = %device_id, action = command.action_name(), "Command executed"),
            Some(e) => tracing::warn!(category = "command", device_id = %device_id, action = command.action_name(), error = %e, "Command failed"),
        }
        result
    }

    async fn execute(&self, device_id: &str, command: &DeviceCommand) -> Result<DeviceState> {
        let device = self
            .registry
            .get_device(device_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("device {}", device_id)))?;

        if !device.is_online() {
            return Err(Error::DeviceOffline(format!("{} is {}", device_id, device.status)));
        }
        let capability = command.required_capability();
        if !device.supports(capability) {
            return Err(Error::CommandRejected(format!(
                "{} does not support {}",
                device_id,
                command.action_name()
            )));
        }
        command.validate()?;

        let adapter = self
            .adapters
            .for_protocol(device.protocol)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no adapter for {}", device.protocol)))?;
        let timeout = self
            .timeouts
            .get(&device.protocol)
            .copied()
            .unwrap_or_else(|| device.protocol.default_timeout());

        match with_timeout(timeout, adapter.send_command(&device, command)).await {
            Ok(()) => {
                self.registry
                    .update_commanded(device_id, |state| apply_command(state, command))
                    .await
            }
            Err(e) => {
                if e.affects_availability() {
                    let _ = self.registry.record_failure(device_id, &e.to_string()).await;
                }
                Err(match e {
                    AdapterError::Protocol(msg) => Error::CommandRejected(format!("device replied: {}", msg)),
                    other => other.into(),
                })
            }
        }
    }

    fn remember(&self, record: CommandRecord) {
        let mut entries = self.history.entry(record.device_id.clone()).or_default();
        entries.push_back(record);
        while entries.len() > self.history_limit {
            entries.pop_front();
        }
    }

    /// Recent commands for a device, oldest first.
    pub fn history(&self, device_id: &str) -> Vec<CommandRecord> {
        self.history
            .get(device_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockAdapter;
    use crate::registry::DeviceRegistry;
    use gridmind_core::{
        Capability, DeviceDescriptor, DeviceStatus, DeviceType, EventBus, Reading, TransportAddress,
    };

    async fn setup() -> (CommandDispatcher, Arc<MockAdapter>, SharedDeviceRegistry, SharedEventBus) {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(DeviceRegistry::new(bus.clone(), 1));
        let mock = Arc::new(MockAdapter::new(Protocol::Tasmota));
        registry
            .upsert(
                DeviceDescriptor::new(
                    "lamp",
                    DeviceType::Lighting,
                    Protocol::Tasmota,
                    TransportAddress::Http {
                        host: "10.0.0.4".into(),
                        port: 80,
                    },
                )
                .with_capability(Capability::Switch)
                .with_capability(Capability::Dimmer),
            )
            .await;
        registry
            .record_success("lamp", Reading::new("lamp", Utc::now(), 9.0))
            .await
            .unwrap();
        let dispatcher = CommandDispatcher::new(registry.clone(), AdapterSet::new().with(mock.clone()), bus.clone());
        (dispatcher, mock, registry, bus)
    }

    #[tokio::test]
    async fn test_command_updates_commanded_state() {
        let (dispatcher, mock, _registry, bus) = setup().await;
        let mut events = bus.subscribe_filtered(|e| matches!(e, GridEvent::CommandCompleted { .. }));

        let state = dispatcher
            .send_command("lamp", DeviceCommand::SetBrightness { level: 35 })
            .await
            .unwrap();
        assert_eq!(state.commanded.brightness, Some(35));
        assert_eq!(mock.sent_commands().len(), 1);

        let (event, _) = events.recv().await.unwrap();
        assert!(matches!(event, GridEvent::CommandCompleted { success: true, .. }));
    }

    #[tokio::test]
    async fn test_rejections_never_reach_adapter() {
        let (dispatcher, mock, registry, _bus) = setup().await;

        let err = dispatcher
            .send_command("lamp", DeviceCommand::SetSetpoint { celsius: 21.0 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandRejected(_)));

        let err = dispatcher
            .send_command("lamp", DeviceCommand::SetBrightness { level: 140 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandRejected(_)));

        assert!(matches!(
            dispatcher.send_command("nope", DeviceCommand::TurnOn).await,
            Err(Error::NotFound(_))
        ));

        registry.mark_offline("lamp", "unplugged").await.unwrap();
        assert!(matches!(
            dispatcher.send_command("lamp", DeviceCommand::TurnOn).await,
            Err(Error::DeviceOffline(_))
        ));

        assert!(mock.sent_commands().is_empty());
        assert_eq!(dispatcher.history("lamp").len(), 3);
    }

    #[tokio::test]
    async fn test_transport_failure_marks_offline() {
        let (dispatcher, mock, registry, _bus) = setup().await;
        mock.set_command_result("lamp", Err(AdapterError::Transport("reset by peer".into())));

        let err = dispatcher.send_command("lamp", DeviceCommand::TurnOff).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(
            registry.get_device_state("lamp").await.unwrap().status,
            DeviceStatus::Offline
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_device_commands_serialized() {
        let (dispatcher, mock, _registry, _bus) = setup().await;
        mock.set_delay(Duration::from_millis(500));
        let dispatcher = Arc::new(dispatcher);
        let begun = tokio::time::Instant::now();

        let a = tokio::spawn({
            let d = dispatcher.clone();
            async move { d.send_command("lamp", DeviceCommand::TurnOn).await }
        });
        let b = tokio::spawn({
            let d = dispatcher.clone();
            async move { d.send_command("lamp", DeviceCommand::TurnOff).await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // Second command waited for the first
        assert!(begun.elapsed() >= Duration::from_millis(1000));
        assert_eq!(dispatcher.history("lamp").len(), 2);
    }

    #[tokio::test]
    async fn test_history_bounded() {
        let (dispatcher, _mock, _registry, _bus) = setup().await;
        let dispatcher = dispatcher.with_history_limit(2);
        for level in [10, 20, 30] {
            dispatcher
                .send_command("lamp", DeviceCommand::SetBrightness { level })
                .await
                .unwrap();
        }
        let history = dispatcher.history("lamp");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].command, DeviceCommand::SetBrightness { level: 20 });
    }

    #[test]
    fn test_apply_toggle_unknown_stays_unknown() {
        let mut state = CommandedState::default();
        apply_command(&mut state, &DeviceCommand::Toggle);
        assert_eq!(state.relay_on, None);
        apply_command(&mut state, &DeviceCommand::TurnOn);
        apply_command(&mut state, &DeviceCommand::Toggle);
        assert_eq!(state.relay_on, Some(false));
    }
}
