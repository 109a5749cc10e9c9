//! Telemetry poller.
//!
//! Every tick, each online device is read through its adapter under the
//! protocol's timeout. On the schedule each read is its own task, so the tick
//! never waits for a slow device; a device whose previous read is still in
//! flight is skipped until it finishes. Offline devices are re-probed every
//! `offline_retry_ticks` ticks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;

use gridmind_core::{
    Device, DeviceStatus, Protocol, Reading, Result, Scheduler, SharedEventBus,
    SharedTelemetryStore, ShutdownSignal,
};

use crate::adapter::{with_timeout, AdapterError, AdapterSet};
use crate::config::PollerConfig;
use crate::registry::SharedDeviceRegistry;

/// Where accepted readings go: registry, store, then bus.
///
/// Shared by the poller and the UDP listener.
#[derive(Clone)]
pub struct ReadingSink {
    registry: SharedDeviceRegistry,
    store: SharedTelemetryStore,
    bus: SharedEventBus,
}

impl ReadingSink {
    pub fn new(registry: SharedDeviceRegistry, store: SharedTelemetryStore, bus: SharedEventBus) -> Self {
        Self { registry, store, bus }
    }

    pub fn registry(&self) -> &SharedDeviceRegistry {
        &self.registry
    }

    /// Accept one reading for a registered device.
    pub async fn accept(&self, reading: Reading, source: &str) -> Result<()> {
        if !reading.is_plausible() {
            tracing::warn!(device_id = %reading.device_id, source, "Discarding implausible reading");
            return Ok(());
        }
        self.registry.record_success(&reading.device_id, reading.clone()).await?;
        if let Err(e) = self.store.store(&reading).await {
            tracing::warn!(category = "storage", device_id = %reading.device_id, error = %e, "Failed to persist reading");
        }
        self.bus.publish_reading(reading, source);
        Ok(())
    }
}

/// What happened to one device during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Success,
    /// Transport failure or timeout, counted toward going offline
    Failed,
    /// Malformed payload, reading dropped, state unchanged
    Discarded,
    Skipped,
}

/// Per-tick counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub polled: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub discarded: usize,
}

pub struct TelemetryPoller {
    sink: ReadingSink,
    adapters: AdapterSet,
    config: PollerConfig,
    timeouts: HashMap<Protocol, Duration>,
    ticks: AtomicU64,
    in_flight: Arc<DashMap<String, ()>>,
    permits: Semaphore,
}

/// Marks a device read as in flight until dropped.
struct InFlight {
    set: Arc<DashMap<String, ()>>,
    device_id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.remove(&self.device_id);
    }
}

impl TelemetryPoller {
    pub fn new(sink: ReadingSink, adapters: AdapterSet, config: PollerConfig) -> Self {
        let permits = Semaphore::new(config.max_concurrency.max(1));
        Self {
            sink,
            adapters,
            config,
            timeouts: HashMap::new(),
            ticks: AtomicU64::new(0),
            in_flight: Arc::new(DashMap::new()),
            permits,
        }
    }

    /// Override the read timeout for one protocol.
    pub fn with_timeout(mut self, protocol: Protocol, timeout: Duration) -> Self {
        self.timeouts.insert(protocol, timeout);
        self
    }

    pub fn timeout_for(&self, protocol: Protocol) -> Duration {
        self.timeouts
            .get(&protocol)
            .copied()
            .unwrap_or_else(|| protocol.default_timeout())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_secs)
    }

    fn due(&self, device: &Device, tick: u64) -> bool {
        if !device.protocol.is_polled() {
            return false;
        }
        match device.status {
            DeviceStatus::Online | DeviceStatus::Discovered => true,
            DeviceStatus::Offline => tick % self.config.offline_retry_ticks.max(1) as u64 == 0,
        }
    }

    async fn next_tick(&self) -> (u64, Vec<Device>) {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let devices = self
            .sink
            .registry
            .list_devices()
            .await
            .into_iter()
            .filter(|d| self.due(d, tick))
            .collect();
        (tick, devices)
    }

    fn claim(&self, device_id: &str) -> Option<InFlight> {
        if self.in_flight.insert(device_id.to_string(), ()).is_some() {
            return None;
        }
        Some(InFlight {
            set: self.in_flight.clone(),
            device_id: device_id.to_string(),
        })
    }

    /// Number of device reads currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Run one polling pass and wait for every read.
    pub async fn poll_once(&self) -> PollSummary {
        let (tick, devices) = self.next_tick().await;

        let outcomes = futures::future::join_all(devices.into_iter().map(|device| async move {
            match self.claim(&device.id) {
                Some(_guard) => self.poll_device(device).await,
                None => PollOutcome::Skipped,
            }
        }))
        .await;

        let mut summary = PollSummary::default();
        for outcome in outcomes {
            match outcome {
                PollOutcome::Success => summary.succeeded += 1,
                PollOutcome::Failed => summary.failed += 1,
                PollOutcome::Discarded => summary.discarded += 1,
                PollOutcome::Skipped => continue,
            }
            summary.polled += 1;
        }
        tracing::debug!(
            category = "poller",
            tick,
            polled = summary.polled,
            succeeded = summary.succeeded,
            failed = summary.failed,
            discarded = summary.discarded,
            "Poll tick finished"
        );
        summary
    }

    /// Launch one read task per due device and return without waiting.
    ///
    /// Devices whose previous read has not finished are skipped. Returns the
    /// number of reads launched.
    pub async fn spawn_tick(self: &Arc<Self>, signal: &ShutdownSignal) -> usize {
        let (tick, devices) = self.next_tick().await;
        let mut launched = 0;
        for device in devices {
            let Some(guard) = self.claim(&device.id) else {
                tracing::debug!(category = "poller", device_id = %device.id, tick, "Previous read still in flight");
                continue;
            };
            let poller = self.clone();
            let mut signal = signal.clone();
            tokio::spawn(async move {
                let _guard = guard;
                tokio::select! {
                    _ = signal.wait() => {}
                    _ = poller.poll_device(device) => {}
                }
            });
            launched += 1;
        }
        tracing::debug!(category = "poller", tick, launched, "Poll tick dispatched");
        launched
    }

    async fn poll_device(&self, device: Device) -> PollOutcome {
        let _permit = self.permits.acquire().await.ok();
        let adapter = match self.adapters.for_protocol(device.protocol) {
            Some(adapter) => adapter.clone(),
            None => {
                tracing::debug!(device_id = %device.id, protocol = %device.protocol, "No adapter for protocol");
                return PollOutcome::Skipped;
            }
        };

        let timeout = self.timeout_for(device.protocol);
        let result = with_timeout(timeout, adapter.read_telemetry(&device)).await;
        match result {
            Ok(mut reading) => {
                // Adapters that know nothing about registry ids must not rename devices
                reading.device_id = device.id.clone();
                match self.sink.accept(reading, "poller").await {
                    Ok(()) => PollOutcome::Success,
                    Err(e) => {
                        tracing::debug!(device_id = %device.id, error = %e, "Device vanished during poll");
                        PollOutcome::Skipped
                    }
                }
            }
            Err(e) if e.affects_availability() => {
                let _ = self.sink.registry.record_failure(&device.id, &e.to_string()).await;
                PollOutcome::Failed
            }
            Err(AdapterError::Protocol(msg)) => {
                tracing::warn!(category = "poller", device_id = %device.id, error = %msg, "Discarding malformed reading");
                PollOutcome::Discarded
            }
            Err(e) => {
                tracing::warn!(category = "poller", device_id = %device.id, error = %e, "Poll failed");
                PollOutcome::Discarded
            }
        }
    }

    /// Schedule `spawn_tick` on the poller interval.
    pub async fn start(self: &Arc<Self>, scheduler: &Scheduler) {
        let poller = self.clone();
        let signal = scheduler.signal();
        scheduler
            .spawn_periodic("telemetry-poller", self.interval(), move || {
                let poller = poller.clone();
                let signal = signal.clone();
                async move {
                    poller.spawn_tick(&signal).await;
                }
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterResult, MockAdapter};
    use crate::registry::DeviceRegistry;
    use gridmind_core::{
        DeviceDescriptor, DeviceType, EventBus, InMemoryTelemetryStore, TelemetryStore,
        TransportAddress,
    };

    struct Fixture {
        poller: TelemetryPoller,
        mock: Arc<MockAdapter>,
        registry: SharedDeviceRegistry,
        store: Arc<InMemoryTelemetryStore>,
        bus: SharedEventBus,
    }

    async fn fixture(ids: &[&str], config: PollerConfig) -> Fixture {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(DeviceRegistry::new(bus.clone(), config.failure_threshold));
        let store = Arc::new(InMemoryTelemetryStore::new());
        let mock = Arc::new(MockAdapter::new(Protocol::Kasa));
        for id in ids {
            registry
                .upsert(DeviceDescriptor::new(
                    *id,
                    DeviceType::SmartPlug,
                    Protocol::Kasa,
                    TransportAddress::Tcp {
                        host: "10.0.0.1".into(),
                        port: 9999,
                    },
                ))
                .await;
        }
        let sink = ReadingSink::new(registry.clone(), store.clone(), bus.clone());
        let poller = TelemetryPoller::new(sink, AdapterSet::new().with(mock.clone()), config);
        Fixture {
            poller,
            mock,
            registry,
            store,
            bus,
        }
    }

    fn fail() -> AdapterResult<f64> {
        Err(AdapterError::Transport("connection refused".into()))
    }

    #[tokio::test]
    async fn test_success_updates_registry_store_and_bus() {
        let f = fixture(&["a"], PollerConfig::default()).await;
        let mut readings = f.bus.subscribe_readings();
        f.mock.script("a", vec![Ok(42.0)]);

        let summary = f.poller.poll_once().await;
        assert_eq!(summary.succeeded, 1);

        let device = f.registry.get_device("a").await.unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.current_power(), Some(42.0));
        assert_eq!(f.store.len("a").await, 1);
        assert_eq!(readings.recv().await.unwrap().power_w, 42.0);
    }

    #[tokio::test]
    async fn test_failure_isolated_per_device() {
        let f = fixture(&["good", "bad"], PollerConfig::default()).await;
        f.mock.script("good", vec![Ok(10.0)]);
        f.mock.script("bad", vec![Ok(5.0), fail()]);

        f.poller.poll_once().await;
        let summary = f.poller.poll_once().await;
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);

        assert!(f.registry.get_device("good").await.unwrap().is_online());
        let bad = f.registry.get_device("bad").await.unwrap();
        assert_eq!(bad.status, DeviceStatus::Offline);
        // Last good reading survives the outage
        assert_eq!(bad.current_power(), Some(5.0));
    }

    #[tokio::test]
    async fn test_protocol_error_discards_without_state_change() {
        let f = fixture(&["a"], PollerConfig::default()).await;
        f.mock.script("a", vec![Ok(1.0), Err(AdapterError::Protocol("crc".into()))]);

        f.poller.poll_once().await;
        let summary = f.poller.poll_once().await;
        assert_eq!(summary.discarded, 1);

        let device = f.registry.get_device("a").await.unwrap();
        assert!(device.is_online());
        assert_eq!(device.consecutive_failures, 0);
        assert_eq!(f.store.len("a").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_device_times_out() {
        let f = fixture(&["slow"], PollerConfig::default()).await;
        f.mock.script("slow", vec![Ok(1.0)]);
        f.mock.set_delay(Duration::from_secs(10));

        let summary = f.poller.poll_once().await;
        assert_eq!(summary.failed, 1);
        let device = f.registry.get_device("slow").await.unwrap();
        assert!(device.last_error.unwrap().contains("3000ms"));
    }

    #[tokio::test]
    async fn test_offline_retry_cadence_and_recovery() {
        let config = PollerConfig {
            offline_retry_ticks: 3,
            ..Default::default()
        };
        let f = fixture(&["a"], config).await;
        f.mock.script("a", vec![fail(), Ok(7.0)]);

        // tick 1: fails, goes offline
        assert_eq!(f.poller.poll_once().await.failed, 1);
        // tick 2: skipped while offline
        assert_eq!(f.poller.poll_once().await.polled, 0);
        // tick 3: re-probed and recovers
        assert_eq!(f.poller.poll_once().await.succeeded, 1);
        assert!(f.registry.get_device("a").await.unwrap().is_online());

        let stored = f
            .store
            .query_range("a", chrono::Utc::now() - chrono::Duration::days(1), chrono::Utc::now())
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_meter_does_not_stall_fast_plug_on_schedule() {
        let f = fixture(&["plug"], PollerConfig::default()).await;
        f.mock.script("plug", vec![Ok(60.0)]);

        let optical = Arc::new(MockAdapter::new(Protocol::Iec62056));
        optical.script("meter", vec![Ok(900.0)]);
        optical.set_delay(Duration::from_secs(60));
        f.registry
            .upsert(DeviceDescriptor::new(
                "meter",
                DeviceType::Meter,
                Protocol::Iec62056,
                TransportAddress::Serial {
                    path: "/dev/ttyUSB0".into(),
                    baud_rate: 300,
                },
            ))
            .await;

        let sink = ReadingSink::new(f.registry.clone(), f.store.clone(), f.bus.clone());
        let poller = Arc::new(TelemetryPoller::new(
            sink,
            AdapterSet::new().with(f.mock.clone()).with(optical),
            PollerConfig::default(),
        ));
        let scheduler = Scheduler::new();
        poller.start(&scheduler).await;

        // ticks at 5, 10, ... 40 while the meter keeps timing out after 10 s
        tokio::time::sleep(Duration::from_secs(41)).await;
        assert_eq!(f.store.len("plug").await, 8);
        assert_eq!(f.store.len("meter").await, 0);
        assert_eq!(
            f.registry.get_device("meter").await.unwrap().status,
            DeviceStatus::Offline
        );

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_in_flight_device_is_skipped() {
        let f = fixture(&["a"], PollerConfig::default()).await;
        f.mock.script("a", vec![Ok(3.0)]);

        let guard = f.poller.claim("a");
        assert!(guard.is_some());
        assert_eq!(f.poller.in_flight(), 1);
        assert_eq!(f.poller.poll_once().await, PollSummary::default());

        drop(guard);
        assert_eq!(f.poller.in_flight(), 0);
        assert_eq!(f.poller.poll_once().await.succeeded, 1);
    }

    #[tokio::test]
    async fn test_push_devices_not_polled() {
        let f = fixture(&[], PollerConfig::default()).await;
        f.registry
            .upsert(DeviceDescriptor::new(
                "pushy",
                DeviceType::Meter,
                Protocol::UdpPush,
                TransportAddress::Push {
                    origin: "10.0.0.9".into(),
                },
            ))
            .await;
        assert_eq!(f.poller.poll_once().await, PollSummary::default());
    }
}
