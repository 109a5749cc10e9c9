//! End-to-end tests for the device layer: discovery, polling, commands.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;

use gridmind_core::{
    Capability, DeviceCommand, DeviceDescriptor, DeviceStatus, DeviceType, Error, EventBus,
    GridEvent, InMemoryTelemetryStore, Protocol, Scheduler, TransportAddress,
};
use gridmind_devices::protocol::xor_cipher;
use gridmind_devices::{
    AdapterError, AdapterSet, CommandDispatcher, DeviceRegistry, KasaAdapter, KasaAdapterConfig,
    MockAdapter, PollerConfig, ReadingSink, TelemetryPoller,
};

fn descriptor(id: &str, protocol: Protocol) -> DeviceDescriptor {
    DeviceDescriptor::new(
        id,
        DeviceType::SmartPlug,
        protocol,
        TransportAddress::Tcp {
            host: "10.0.0.20".into(),
            port: 9999,
        },
    )
    .with_capability(Capability::Switch)
}

/// Fake HS110 that tracks its relay and reports 60 W while on.
async fn fake_hs110() -> (u16, Arc<Mutex<bool>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = Arc::new(Mutex::new(true));
    let state = relay.clone();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = xor_cipher::read_message(&mut socket).await.unwrap();
            let request: Value = serde_json::from_slice(&request).unwrap();
            let reply = if request.pointer("/emeter/get_realtime").is_some() {
                let power_mw = if *state.lock().unwrap() { 60_000 } else { 0 };
                json!({"emeter": {"get_realtime": {"power_mw": power_mw, "voltage_mv": 230_000, "current_ma": 260, "total_wh": 12, "err_code": 0}}})
            } else if let Some(v) = request.pointer("/system/set_relay_state/state") {
                *state.lock().unwrap() = v.as_i64() == Some(1);
                json!({"system": {"set_relay_state": {"err_code": 0}}})
            } else {
                json!({"system": {"get_sysinfo": {"err_code": 0, "relay_state": 1, "mac": "50:C7:BF:00:11:22", "alias": "Desk", "model": "HS110(EU)"}}})
            };
            xor_cipher::write_message(&mut socket, reply.to_string().as_bytes())
                .await
                .unwrap();
        }
    });
    (port, relay)
}

#[tokio::test]
async fn test_discover_poll_command_with_mock() {
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(DeviceRegistry::new(bus.clone(), 1));
    let store = Arc::new(InMemoryTelemetryStore::new());
    let mock = Arc::new(
        MockAdapter::new(Protocol::Shelly)
            .with_discovered(descriptor("heater", Protocol::Shelly))
            .with_discovered(descriptor("fridge", Protocol::Shelly)),
    );
    mock.script("heater", vec![Ok(1500.0)]);
    mock.script("fridge", vec![Ok(90.0)]);
    let adapters = AdapterSet::new().with(mock.clone());

    let report = registry.discover(&adapters).await;
    assert_eq!(report.devices.len(), 2);
    assert!(report.errors.is_empty());

    let sink = ReadingSink::new(registry.clone(), store.clone(), bus.clone());
    let poller = TelemetryPoller::new(sink, adapters.clone(), PollerConfig::default());
    let summary = poller.poll_once().await;
    assert_eq!(summary.succeeded, 2);

    let dispatcher = CommandDispatcher::new(registry.clone(), adapters, bus.clone());
    let state = dispatcher
        .send_command("heater", DeviceCommand::TurnOff)
        .await
        .unwrap();
    assert_eq!(state.commanded.relay_on, Some(false));
    assert_eq!(
        mock.sent_commands(),
        vec![("heater".to_string(), DeviceCommand::TurnOff)]
    );
}

#[tokio::test]
async fn test_kasa_plug_through_pipeline() {
    let (port, relay) = fake_hs110().await;
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(DeviceRegistry::new(bus.clone(), 1));
    let store = Arc::new(InMemoryTelemetryStore::new());
    let kasa = Arc::new(KasaAdapter::new(&KasaAdapterConfig {
        port,
        timeout_ms: 1000,
        ..Default::default()
    }));
    let adapters = AdapterSet::new().with(kasa);

    registry
        .register_static(
            DeviceDescriptor::new(
                "desk",
                DeviceType::SmartPlug,
                Protocol::Kasa,
                TransportAddress::Tcp {
                    host: "127.0.0.1".into(),
                    port,
                },
            )
            .with_capability(Capability::Switch),
            false,
        )
        .await;

    let mut readings = bus.subscribe_readings();
    let sink = ReadingSink::new(registry.clone(), store.clone(), bus.clone());
    let poller = TelemetryPoller::new(sink, adapters.clone(), PollerConfig::default());
    assert_eq!(poller.poll_once().await.succeeded, 1);
    let reading = readings.recv().await.unwrap();
    assert_eq!(reading.device_id, "desk");
    assert!((reading.power_w - 60.0).abs() < 1e-9);

    let dispatcher = CommandDispatcher::new(registry.clone(), adapters, bus.clone());
    dispatcher
        .send_command("desk", DeviceCommand::TurnOff)
        .await
        .unwrap();
    assert!(!*relay.lock().unwrap());

    poller.poll_once().await;
    let device = registry.get_device("desk").await.unwrap();
    assert_eq!(device.current_power(), Some(0.0));
    assert_eq!(store.len("desk").await, 2);
}

#[tokio::test]
async fn test_unreachable_plug_goes_offline_and_rejects_commands() {
    // Bind then drop to get a port nobody listens on
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(DeviceRegistry::new(bus.clone(), 1));
    let kasa = Arc::new(KasaAdapter::new(&KasaAdapterConfig {
        port,
        timeout_ms: 500,
        ..Default::default()
    }));
    let adapters = AdapterSet::new().with(kasa);
    registry
        .upsert(
            DeviceDescriptor::new(
                "gone",
                DeviceType::SmartPlug,
                Protocol::Kasa,
                TransportAddress::Tcp {
                    host: "127.0.0.1".into(),
                    port,
                },
            )
            .with_capability(Capability::Switch),
        )
        .await;

    let mut events = bus.subscribe_device_events();
    let sink = ReadingSink::new(registry.clone(), Arc::new(InMemoryTelemetryStore::new()), bus.clone());
    let poller = TelemetryPoller::new(sink, adapters.clone(), PollerConfig::default());
    assert_eq!(poller.poll_once().await.failed, 1);
    assert_eq!(
        registry.get_device("gone").await.unwrap().status,
        DeviceStatus::Offline
    );

    let (event, meta) = events.recv().await.unwrap();
    assert!(matches!(event, GridEvent::DeviceDiscovered { .. } | GridEvent::DeviceOffline { .. }));
    assert_eq!(meta.source, "registry");

    let dispatcher = CommandDispatcher::new(registry, adapters, bus);
    assert!(matches!(
        dispatcher.send_command("gone", DeviceCommand::TurnOn).await,
        Err(Error::DeviceOffline(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_poller_stops_on_shutdown() {
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(DeviceRegistry::new(bus.clone(), 1));
    let store = Arc::new(InMemoryTelemetryStore::new());
    let mock = Arc::new(MockAdapter::new(Protocol::Tasmota));
    mock.script("lamp", vec![Ok(8.0), Err(AdapterError::Protocol("garbled".into())), Ok(9.0)]);
    registry.upsert(descriptor("lamp", Protocol::Tasmota)).await;

    let sink = ReadingSink::new(registry.clone(), store.clone(), bus);
    let poller = Arc::new(TelemetryPoller::new(
        sink,
        AdapterSet::new().with(mock),
        PollerConfig {
            interval_secs: 5,
            ..Default::default()
        },
    ));
    let scheduler = Scheduler::new();
    poller.start(&scheduler).await;

    tokio::time::sleep(Duration::from_secs(16)).await;
    scheduler.shutdown().await;
    let stored = store.len("lamp").await;
    assert!(stored >= 2, "expected at least two stored readings, got {}", stored);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(store.len("lamp").await, stored);
}
