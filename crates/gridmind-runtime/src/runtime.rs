//! The explicit context object wiring every service together.
//!
//! Construction is synchronous apart from opening the store; nothing talks to
//! devices until [`GridRuntime::start`]. [`GridRuntime::shutdown`] stops every
//! background task and may be called more than once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gridmind_anomaly::{Anomaly, AnomalyDetector};
use gridmind_core::config::StorageBackend;
use gridmind_core::{
    Device, DeviceCommand, DeviceState, Error, EventBus, InMemoryTelemetryStore, ReadingStream,
    Result, Scheduler, SharedClock, SharedEventBus, SharedTelemetryStore, SystemClock,
};
use gridmind_devices::{
    build_adapters, AdapterSet, CommandDispatcher, DeviceRegistry, DiscoveryReport, PushListener,
    ReadingSink, SharedDeviceRegistry, SharedSerialOpener, SystemSerialOpener, TelemetryPoller,
};
use gridmind_optimizer::{LoadBalancer, OptimizationEngine, OptimizationResult};
use gridmind_storage::RedbTelemetryStore;

use crate::config::GridConfig;

/// Overrides for the pieces [`GridRuntime`] would otherwise build itself.
pub struct RuntimeBuilder {
    config: GridConfig,
    clock: Option<SharedClock>,
    store: Option<SharedTelemetryStore>,
    adapters: Option<AdapterSet>,
    opener: Option<SharedSerialOpener>,
}

impl RuntimeBuilder {
    pub fn new(config: GridConfig) -> Self {
        Self {
            config,
            clock: None,
            store: None,
            adapters: None,
            opener: None,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_store(mut self, store: SharedTelemetryStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Use these adapters instead of building them from `[adapters]`.
    pub fn with_adapters(mut self, adapters: AdapterSet) -> Self {
        self.adapters = Some(adapters);
        self
    }

    pub fn with_serial_opener(mut self, opener: SharedSerialOpener) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn build(self) -> Result<GridRuntime> {
        let config = self.config;
        config.validate()?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new(config.runtime.timezone_offset_minutes)));
        let bus: SharedEventBus = Arc::new(EventBus::with_capacity(config.runtime.event_capacity));
        let store = match self.store {
            Some(store) => store,
            None => open_store(&config)?,
        };
        let adapters = match self.adapters {
            Some(adapters) => adapters,
            None => {
                let opener = self.opener.unwrap_or_else(|| Arc::new(SystemSerialOpener));
                build_adapters(&config.adapters, &config.discovery, opener)?
            }
        };

        let registry: SharedDeviceRegistry =
            Arc::new(DeviceRegistry::new(bus.clone(), config.poller.failure_threshold));
        let sink = ReadingSink::new(registry.clone(), store.clone(), bus.clone());

        let mut poller = TelemetryPoller::new(sink.clone(), adapters.clone(), config.poller.clone());
        let mut dispatcher = CommandDispatcher::new(registry.clone(), adapters.clone(), bus.clone());
        for (protocol, timeout) in config.protocol_timeouts() {
            poller = poller.with_timeout(protocol, timeout);
            dispatcher = dispatcher.with_timeout(protocol, timeout);
        }
        let dispatcher = Arc::new(dispatcher);

        let listener = config
            .listener
            .enabled
            .then(|| Arc::new(PushListener::new(sink, &config.listener)));

        let detector = Arc::new(AnomalyDetector::new(config.anomaly.clone(), clock.clone(), bus.clone()));
        let engine = Arc::new(OptimizationEngine::new(
            config.optimizer.clone(),
            registry.clone(),
            dispatcher.clone(),
            clock.clone(),
            bus.clone(),
        ));
        let balancer = Arc::new(LoadBalancer::new(
            config.load_balancing.clone(),
            engine.clone(),
            store.clone(),
        ));
        let scheduler = Scheduler::new().with_grace(Duration::from_secs(config.runtime.shutdown_grace_secs));

        Ok(GridRuntime {
            config,
            clock,
            bus,
            store,
            adapters,
            registry,
            poller: Arc::new(poller),
            dispatcher,
            listener,
            detector,
            engine,
            balancer,
            scheduler,
            started: AtomicBool::new(false),
        })
    }
}

fn open_store(config: &GridConfig) -> Result<SharedTelemetryStore> {
    match config.storage.backend {
        StorageBackend::Memory => Ok(Arc::new(InMemoryTelemetryStore::with_retention(
            config.storage.memory_retention,
        ))),
        StorageBackend::Redb => {
            let path = &config.storage.path;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Storage(format!("{}: {}", parent.display(), e)))?;
            }
            tracing::info!(category = "storage", path = %path.display(), "Opening telemetry database");
            Ok(Arc::new(RedbTelemetryStore::open(path)?))
        }
    }
}

pub struct GridRuntime {
    config: GridConfig,
    clock: SharedClock,
    bus: SharedEventBus,
    store: SharedTelemetryStore,
    adapters: AdapterSet,
    registry: SharedDeviceRegistry,
    poller: Arc<TelemetryPoller>,
    dispatcher: Arc<CommandDispatcher>,
    listener: Option<Arc<PushListener>>,
    detector: Arc<AnomalyDetector>,
    engine: Arc<OptimizationEngine>,
    balancer: Arc<LoadBalancer>,
    scheduler: Scheduler,
    started: AtomicBool,
}

impl GridRuntime {
    /// Build with system clock, configured store and configured adapters.
    pub fn build(config: GridConfig) -> Result<Self> {
        RuntimeBuilder::new(config).build()
    }

    pub fn builder(config: GridConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    /// Register static devices, run a first discovery pass, and launch the
    /// background tasks.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Runtime already started");
            return Ok(());
        }

        for device in &self.config.devices {
            self.registry
                .register_static(device.descriptor()?, device.essential)
                .await;
        }

        if self.config.discovery.enabled {
            self.discover().await;
            let registry = self.registry.clone();
            let adapters = self.adapters.clone();
            self.scheduler
                .spawn_periodic(
                    "discovery",
                    Duration::from_secs(self.config.discovery.interval_secs),
                    move || {
                        let registry = registry.clone();
                        let adapters = adapters.clone();
                        async move {
                            registry.discover(&adapters).await;
                        }
                    },
                )
                .await;
        }

        self.poller.start(&self.scheduler).await;

        if let Some(listener) = &self.listener {
            let addr = listener.start(&self.scheduler).await?;
            tracing::info!(category = "listener", addr = %addr, "Push listener bound");
        }

        if self.config.anomaly.enabled {
            if self.config.anomaly.bootstrap_from_store {
                if let Err(e) = self.detector.bootstrap(self.store.as_ref()).await {
                    tracing::warn!(category = "anomaly", error = %e, "Anomaly bootstrap failed");
                }
            }
            self.detector.start(&self.scheduler).await;
        }

        if self.config.optimizer.enabled {
            self.engine.start(&self.scheduler).await;
        }
        if self.config.load_balancing.enabled {
            self.balancer.start(&self.scheduler).await;
        }

        tracing::info!(
            devices = self.registry.device_count().await,
            tasks = self.scheduler.task_count().await,
            "GridMind runtime started"
        );
        Ok(())
    }

    /// Stop every background task. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    /// Run one discovery pass now.
    pub async fn discover(&self) -> DiscoveryReport {
        let report = self.registry.discover(&self.adapters).await;
        for error in &report.errors {
            tracing::warn!(category = "discovery", error = %error, "Adapter discovery failed");
        }
        report
    }

    // ========== Facade ==========

    pub async fn list_devices(&self) -> Vec<Device> {
        self.registry.list_devices().await
    }

    pub async fn get_device_state(&self, device_id: &str) -> Option<DeviceState> {
        self.registry.get_device_state(device_id).await
    }

    pub fn subscribe_readings(&self) -> ReadingStream {
        self.bus.subscribe_readings()
    }

    pub async fn send_command(&self, device_id: &str, command: DeviceCommand) -> Result<DeviceState> {
        self.dispatcher.send_command(device_id, command).await
    }

    pub async fn list_anomalies(&self) -> Vec<Anomaly> {
        self.detector.list_anomalies().await
    }

    pub async fn resolve_anomaly(&self, anomaly_id: &str) -> Result<Anomaly> {
        self.detector.resolve_anomaly(anomaly_id).await
    }

    pub async fn list_optimization_results(&self) -> Vec<OptimizationResult> {
        self.engine.list_results().await
    }

    // ========== Accessors ==========

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn bus(&self) -> &SharedEventBus {
        &self.bus
    }

    pub fn store(&self) -> &SharedTelemetryStore {
        &self.store
    }

    pub fn registry(&self) -> &SharedDeviceRegistry {
        &self.registry
    }

    pub fn poller(&self) -> &Arc<TelemetryPoller> {
        &self.poller
    }

    pub fn detector(&self) -> &Arc<AnomalyDetector> {
        &self.detector
    }

    pub fn engine(&self) -> &Arc<OptimizationEngine> {
        &self.engine
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}
