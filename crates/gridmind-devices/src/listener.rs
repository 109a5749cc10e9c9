//! Passive UDP listener for push-capable devices.
//!
//! Devices send JSON datagrams unsolicited:
//!
//! ```json
//! {"type": "announce", "id": "heatpump", "device_type": "hvac", "name": "Heat pump"}
//! {"type": "telemetry", "id": "heatpump", "power": 1830.5, "voltage": 229.8}
//! ```
//!
//! Telemetry from an unknown id registers the device on the fly. Accepted
//! readings go through the same [`ReadingSink`] as polled ones.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::net::UdpSocket;

use gridmind_core::{
    Capability, DeviceDescriptor, DeviceType, Error, Protocol, Reading, Result, Scheduler,
    TransportAddress,
};

use crate::config::ListenerConfig;
use crate::poller::ReadingSink;

/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 8 * 1024;

/// Wire format of a push datagram.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    Announce {
        id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        device_type: Option<DeviceType>,
        #[serde(default)]
        capabilities: BTreeSet<Capability>,
        #[serde(default)]
        max_power: Option<f64>,
    },
    Telemetry {
        id: String,
        power: f64,
        #[serde(default)]
        voltage: Option<f64>,
        #[serde(default)]
        current: Option<f64>,
        #[serde(default)]
        energy: Option<f64>,
        #[serde(default)]
        frequency: Option<f64>,
        #[serde(default)]
        pf: Option<f64>,
        #[serde(default)]
        temperature: Option<f64>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
}

impl PushMessage {
    pub fn device_id(&self) -> &str {
        match self {
            Self::Announce { id, .. } | Self::Telemetry { id, .. } => id,
        }
    }
}

pub struct PushListener {
    sink: ReadingSink,
    bind: String,
}

impl PushListener {
    pub fn new(sink: ReadingSink, config: &ListenerConfig) -> Self {
        Self {
            sink,
            bind: config.bind.clone(),
        }
    }

    pub async fn bind(&self) -> Result<UdpSocket> {
        UdpSocket::bind(&self.bind)
            .await
            .map_err(|e| Error::Transport(format!("cannot bind UDP {}: {}", self.bind, e)))
    }

    fn descriptor(id: &str, peer: SocketAddr) -> DeviceDescriptor {
        DeviceDescriptor::new(
            id,
            DeviceType::Other,
            Protocol::UdpPush,
            TransportAddress::Push {
                origin: peer.ip().to_string(),
            },
        )
    }

    /// Decode and apply one datagram.
    pub async fn handle_datagram(&self, payload: &[u8], peer: SocketAddr) -> Result<()> {
        let message: PushMessage = serde_json::from_slice(payload)
            .map_err(|e| Error::Protocol(format!("bad datagram from {}: {}", peer, e)))?;
        if message.device_id().trim().is_empty() {
            return Err(Error::Protocol(format!("datagram from {} has empty id", peer)));
        }

        match message {
            PushMessage::Announce {
                id,
                name,
                device_type,
                capabilities,
                max_power,
            } => {
                let mut descriptor = Self::descriptor(&id, peer);
                descriptor.device_type = device_type.unwrap_or(DeviceType::Other);
                descriptor.capabilities.extend(capabilities);
                if let Some(name) = name {
                    descriptor = descriptor.with_name(name);
                }
                if let Some(max) = max_power {
                    descriptor = descriptor.with_max_power(max);
                }
                self.sink.registry().upsert(descriptor).await;
                Ok(())
            }
            PushMessage::Telemetry {
                id,
                power,
                voltage,
                current,
                energy,
                frequency,
                pf,
                temperature,
                timestamp,
            } => {
                if self.sink.registry().get_device(&id).await.is_none() {
                    self.sink.registry().upsert(Self::descriptor(&id, peer)).await;
                }
                let mut reading = Reading::new(id, timestamp.unwrap_or_else(Utc::now), power);
                if let Some(v) = voltage {
                    reading = reading.with_voltage(v);
                }
                if let Some(a) = current {
                    reading = reading.with_current(a);
                }
                if let Some(kwh) = energy {
                    reading = reading.with_energy(kwh);
                }
                if let Some(hz) = frequency {
                    reading = reading.with_frequency(hz);
                }
                if let Some(pf) = pf {
                    reading = reading.with_power_factor(pf);
                }
                if let Some(t) = temperature {
                    reading = reading.with_temperature(t);
                }
                self.sink.accept(reading, "udp-listener").await
            }
        }
    }

    /// Receive datagrams until the socket fails.
    pub async fn run(&self, socket: UdpSocket) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        tracing::info!(category = "listener", bind = %self.bind, "UDP push listener started");
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::error!(category = "listener", error = %e, "UDP receive failed");
                    return;
                }
            };
            if let Err(e) = self.handle_datagram(&buf[..len], peer).await {
                tracing::debug!(category = "listener", peer = %peer, error = %e, "Datagram rejected");
            }
        }
    }

    /// Bind and run under the scheduler.
    pub async fn start(self: &Arc<Self>, scheduler: &Scheduler) -> Result<SocketAddr> {
        let socket = self.bind().await?;
        let local = socket
            .local_addr()
            .map_err(|e| Error::Transport(e.to_string()))?;
        let listener = self.clone();
        scheduler
            .spawn("udp-listener", async move { listener.run(socket).await })
            .await;
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceRegistry;
    use gridmind_core::{DeviceStatus, EventBus, InMemoryTelemetryStore};

    fn listener() -> (Arc<PushListener>, Arc<DeviceRegistry>, Arc<InMemoryTelemetryStore>) {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(DeviceRegistry::new(bus.clone(), 1));
        let store = Arc::new(InMemoryTelemetryStore::new());
        let sink = ReadingSink::new(registry.clone(), store.clone(), bus);
        let config = ListenerConfig {
            enabled: true,
            bind: "127.0.0.1:0".into(),
        };
        (Arc::new(PushListener::new(sink, &config)), registry, store)
    }

    fn peer() -> SocketAddr {
        "10.0.0.42:5000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_announce_then_telemetry() {
        let (listener, registry, store) = listener();
        listener
            .handle_datagram(
                br#"{"type":"announce","id":"hp","device_type":"hvac","name":"Heat pump"}"#,
                peer(),
            )
            .await
            .unwrap();
        let device = registry.get_device("hp").await.unwrap();
        assert_eq!(device.device_type, DeviceType::Hvac);
        assert_eq!(device.status, DeviceStatus::Discovered);

        listener
            .handle_datagram(br#"{"type":"telemetry","id":"hp","power":1830.5,"voltage":229.8}"#, peer())
            .await
            .unwrap();
        let device = registry.get_device("hp").await.unwrap();
        assert!(device.is_online());
        assert_eq!(device.current_power(), Some(1830.5));
        assert_eq!(store.len("hp").await, 1);
    }

    #[tokio::test]
    async fn test_unknown_telemetry_registers_device() {
        let (listener, registry, _store) = listener();
        listener
            .handle_datagram(br#"{"type":"telemetry","id":"solar","power":-2400}"#, peer())
            .await
            .unwrap();
        let device = registry.get_device("solar").await.unwrap();
        assert_eq!(device.protocol, Protocol::UdpPush);
        assert_eq!(
            device.address,
            TransportAddress::Push {
                origin: "10.0.0.42".into()
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_datagrams_rejected() {
        let (listener, registry, _store) = listener();
        let bad_datagrams: [&[u8]; 3] = [
            b"not json",
            br#"{"type":"telemetry","id":"x"}"#,
            br#"{"type":"announce","id":" "}"#,
        ];
        for bad in bad_datagrams {
            assert!(matches!(
                listener.handle_datagram(bad, peer()).await,
                Err(Error::Protocol(_))
            ));
        }
        assert_eq!(registry.device_count().await, 0);
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let (listener, registry, _store) = listener();
        let scheduler = Scheduler::new();
        let local = listener.start(&scheduler).await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(br#"{"type":"telemetry","id":"boiler","power":2000}"#, local)
            .await
            .unwrap();

        for _ in 0..50 {
            if registry.get_device("boiler").await.map(|d| d.is_online()).unwrap_or(false) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(registry.get_device("boiler").await.unwrap().is_online());
        scheduler.shutdown().await;
    }
}
