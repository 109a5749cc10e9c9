//! Engine and load balancer against a mock device fleet.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use gridmind_core::{
    Capability, DeviceCommand, DeviceDescriptor, DeviceType, EventBus, InMemoryTelemetryStore,
    ManualClock, Protocol, Reading, Scheduler, SharedTelemetryStore, TelemetryStore,
    TransportAddress,
};
use gridmind_devices::{AdapterSet, CommandDispatcher, DeviceRegistry, MockAdapter, SharedDeviceRegistry};
use gridmind_optimizer::{
    BalancingStrategy, LoadBalancer, LoadBalancingConfig, OptimizationEngine, OptimizerConfig,
    LOAD_BALANCING_RULE,
};

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap()
}

async fn plug(registry: &SharedDeviceRegistry, id: &str, power: f64, at: DateTime<Utc>) {
    registry
        .upsert(
            DeviceDescriptor::new(
                id,
                DeviceType::SmartPlug,
                Protocol::Tasmota,
                TransportAddress::Http {
                    host: format!("10.0.1.{}", id.len()),
                    port: 80,
                },
            )
            .with_capability(Capability::Switch)
            .with_capability(Capability::PowerLimit),
        )
        .await;
    registry.record_success(id, Reading::new(id, at, power)).await.unwrap();
}

fn engine(
    config: OptimizerConfig,
    start: DateTime<Utc>,
) -> (Arc<OptimizationEngine>, SharedDeviceRegistry, Arc<MockAdapter>) {
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(DeviceRegistry::new(bus.clone(), 1));
    let mock = Arc::new(MockAdapter::new(Protocol::Tasmota));
    let dispatcher = Arc::new(CommandDispatcher::new(
        registry.clone(),
        AdapterSet::new().with(mock.clone()),
        bus.clone(),
    ));
    let engine = Arc::new(OptimizationEngine::new(
        config,
        registry.clone(),
        dispatcher,
        Arc::new(ManualClock::new(start)),
        bus,
    ));
    (engine, registry, mock)
}

#[tokio::test]
async fn test_average_trim_cuts_the_outlier() {
    let config = OptimizerConfig {
        default_rules: false,
        ..Default::default()
    };
    let (engine, registry, mock) = engine(config, noon());
    plug(&registry, "kettle", 3000.0, noon()).await;
    plug(&registry, "desk", 1000.0, noon()).await;
    plug(&registry, "tv", 1000.0, noon()).await;

    let store: SharedTelemetryStore = Arc::new(InMemoryTelemetryStore::new());
    store
        .store(&Reading::new("kettle", noon() - chrono::Duration::minutes(5), 3500.0))
        .await
        .unwrap();

    let balancer = LoadBalancer::new(
        LoadBalancingConfig {
            strategy: BalancingStrategy::AverageTrim,
            max_reduction_w: 5000.0,
            ..Default::default()
        },
        engine.clone(),
        store,
    );

    let results = balancer.balance_once().await;
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.rule_id, LOAD_BALANCING_RULE);
    assert_eq!(result.device_id, "kettle");
    assert!(result.success);

    // peaks 3500 / 1000 / 1000 average 1833.3; the kettle sheds the difference
    let expected = 3000.0 - (3500.0 - 5500.0 / 3.0);
    match &mock.sent_commands()[0] {
        (id, DeviceCommand::SetPowerLimit { watts }) => {
            assert_eq!(id, "kettle");
            assert!((watts - expected).abs() < 1e-6, "limit {}", watts);
        }
        other => panic!("unexpected command {:?}", other),
    }

    // same device is left alone while cooling down
    assert!(balancer.balance_once().await.is_empty());
    assert_eq!(engine.list_results().await.len(), 1);
}

#[tokio::test]
async fn test_balanced_fleet_is_untouched() {
    let (engine, registry, mock) = engine(OptimizerConfig::default(), noon());
    plug(&registry, "a", 500.0, noon()).await;
    plug(&registry, "b", 520.0, noon()).await;

    let balancer = LoadBalancer::new(
        LoadBalancingConfig::default(),
        engine,
        Arc::new(InMemoryTelemetryStore::new()),
    );
    assert!(balancer.balance_once().await.is_empty());
    assert!(mock.sent_commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_engine_runs_on_schedule() {
    let evening = Utc.with_ymd_and_hms(2024, 6, 3, 19, 0, 0).unwrap();
    let (engine, registry, mock) = engine(OptimizerConfig::default(), evening);
    plug(&registry, "ev_charger", 7000.0, evening).await;

    let scheduler = Scheduler::new();
    engine.start(&scheduler).await;

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(
        mock.sent_commands(),
        vec![("ev_charger".to_string(), DeviceCommand::SetPowerLimit { watts: 6000.0 })]
    );

    scheduler.shutdown().await;
    assert_eq!(engine.stats().await.evaluations, 1);
}
