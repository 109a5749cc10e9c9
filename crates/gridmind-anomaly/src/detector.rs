//! Anomaly detector service.
//!
//! Consumes the reading stream, keeps a rolling history per device, rebuilds
//! baselines periodically and classifies every reading against the current
//! baseline. Open anomalies are deduplicated per (device, type).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;

use gridmind_core::{
    Error, GridEvent, Reading, Result, Scheduler, SharedClock, SharedEventBus, TelemetryStore,
};

use crate::anomaly::{Anomaly, AnomalyType, Finding};
use crate::baseline::{hourly_sums, local_hour, BaselinePattern, HOURS};
use crate::classifier;
use crate::config::AnomalyConfig;

const EVENT_SOURCE: &str = "anomaly";

/// Readings below this magnitude carry no useful power factor.
const MIN_POWER_FOR_PF_W: f64 = 1.0;

/// Result of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub auto_resolved: usize,
    pub purged: usize,
}

pub struct AnomalyDetector {
    config: AnomalyConfig,
    clock: SharedClock,
    bus: SharedEventBus,
    history: DashMap<String, VecDeque<Reading>>,
    baselines: RwLock<HashMap<String, BaselinePattern>>,
    anomalies: RwLock<Vec<Anomaly>>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig, clock: SharedClock, bus: SharedEventBus) -> Self {
        Self {
            config,
            clock,
            bus,
            history: DashMap::new(),
            baselines: RwLock::new(HashMap::new()),
            anomalies: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// Append a reading to the rolling history without classifying it.
    pub fn record(&self, reading: &Reading) {
        let cutoff = reading.timestamp - self.config.history_window();
        let mut entries = self.history.entry(reading.device_id.clone()).or_default();
        entries.push_back(reading.clone());
        while entries
            .front()
            .map(|r| r.timestamp < cutoff)
            .unwrap_or(false)
        {
            entries.pop_front();
        }
        while entries.len() > self.config.max_history_per_device {
            entries.pop_front();
        }
    }

    pub fn history_len(&self, device_id: &str) -> usize {
        self.history.get(device_id).map(|h| h.len()).unwrap_or(0)
    }

    fn history_snapshot(&self, device_id: &str) -> Vec<Reading> {
        self.history
            .get(device_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Recent power factors of loaded samples, oldest first.
    fn recent_power_factors(&self, device_id: &str) -> Vec<f64> {
        let window = self.config.efficiency_window;
        let Some(entries) = self.history.get(device_id) else {
            return Vec::new();
        };
        let mut factors: Vec<f64> = entries
            .iter()
            .rev()
            .filter(|r| r.power_w.abs() > MIN_POWER_FOR_PF_W && r.power_factor > 0.0)
            .take(window)
            .map(|r| r.power_factor)
            .collect();
        factors.reverse();
        factors
    }

    /// Record and classify one reading. Returns the anomalies it opened or updated.
    pub async fn process_reading(&self, reading: &Reading) -> Vec<Anomaly> {
        if !reading.power_w.is_finite() {
            return Vec::new();
        }
        self.record(reading);

        let mut findings = Vec::new();
        let baseline = self.baselines.read().await.get(&reading.device_id).cloned();
        if let Some(baseline) = baseline {
            let hour = local_hour(reading.timestamp, self.clock.offset());
            findings.extend(classifier::check_spike(&baseline, hour, reading.power_w));
            findings.extend(classifier::check_drop(&baseline, hour, reading.power_w));
            findings.extend(classifier::check_unusual_timing(&baseline, hour, reading.power_w));
        }
        let factors = self.recent_power_factors(&reading.device_id);
        if factors.len() >= self.config.efficiency_window {
            findings.extend(classifier::check_efficiency_loss(&factors));
        }

        let mut touched = Vec::with_capacity(findings.len());
        for finding in findings {
            touched.push(self.open_or_merge(&reading.device_id, finding).await);
        }
        touched
    }

    /// Open a new anomaly or fold the finding into a recent open one.
    async fn open_or_merge(&self, device_id: &str, finding: Finding) -> Anomaly {
        let now = self.clock.now();
        let since = now - self.config.dedup_window();
        let (anomaly, merged) = {
            let mut anomalies = self.anomalies.write().await;
            let existing = anomalies.iter_mut().find(|a| {
                a.is_open()
                    && a.device_id == device_id
                    && a.anomaly_type == finding.anomaly_type
                    && a.detected_at >= since
            });
            match existing {
                Some(existing) => {
                    existing.merge(finding, now);
                    (existing.clone(), true)
                }
                None => {
                    let anomaly = Anomaly::from_finding(device_id, finding, now);
                    anomalies.push(anomaly.clone());
                    (anomaly, false)
                }
            }
        };

        if merged {
            tracing::debug!(
                category = "anomaly",
                device_id = %device_id,
                anomaly_type = %anomaly.anomaly_type,
                occurrences = anomaly.occurrences,
                "Anomaly repeated"
            );
        } else {
            tracing::warn!(
                category = "anomaly",
                device_id = %device_id,
                anomaly_type = %anomaly.anomaly_type,
                severity = %anomaly.severity,
                deviation_pct = anomaly.deviation_pct,
                "{}",
                anomaly.description
            );
        }
        self.bus.publish(
            GridEvent::AnomalyDetected {
                anomaly_id: anomaly.id.clone(),
                device_id: device_id.to_string(),
                anomaly_type: anomaly.anomaly_type.as_str().to_string(),
                severity: anomaly.severity.as_str().to_string(),
                confidence: anomaly.confidence,
            },
            EVENT_SOURCE,
        );
        anomaly
    }

    /// Rebuild one device's baseline from its history.
    pub async fn rebuild_baseline(&self, device_id: &str) -> Option<BaselinePattern> {
        let history = self.history_snapshot(device_id);
        let baseline = BaselinePattern::build(
            device_id,
            &history,
            self.config.sensitivity,
            self.config.min_data_points,
            self.clock.offset(),
            self.clock.now(),
        )?;
        self.baselines
            .write()
            .await
            .insert(device_id.to_string(), baseline.clone());
        Some(baseline)
    }

    /// Rebuild every baseline with enough history. Returns how many were built.
    pub async fn rebuild_baselines(&self) -> usize {
        let ids: Vec<String> = self.history.iter().map(|e| e.key().clone()).collect();
        let mut built = 0;
        for id in ids {
            if self.rebuild_baseline(&id).await.is_some() {
                built += 1;
            }
        }
        tracing::debug!(category = "anomaly", built, "Baselines rebuilt");
        built
    }

    pub async fn baseline(&self, device_id: &str) -> Option<BaselinePattern> {
        self.baselines.read().await.get(device_id).cloned()
    }

    /// Install a baseline directly, e.g. one restored from elsewhere.
    pub async fn set_baseline(&self, baseline: BaselinePattern) {
        self.baselines
            .write()
            .await
            .insert(baseline.device_id.clone(), baseline);
    }

    /// Compare the last day of every device against its stored baseline.
    pub async fn check_patterns(&self) -> Vec<Anomaly> {
        let since = self.clock.now() - chrono::Duration::hours(HOURS as i64);
        let baselines: Vec<BaselinePattern> = self.baselines.read().await.values().cloned().collect();

        let mut touched = Vec::new();
        for baseline in baselines {
            let recent: Vec<Reading> = self
                .history_snapshot(&baseline.device_id)
                .into_iter()
                .filter(|r| r.timestamp >= since)
                .collect();
            let (sums, counts) = hourly_sums(&recent, self.clock.offset());
            let mut fresh = [0.0; HOURS];
            for hour in 0..HOURS {
                if counts[hour] > 0 {
                    fresh[hour] = sums[hour] / counts[hour] as f64;
                }
            }
            if let Some(finding) = classifier::check_pattern_deviation(&baseline, &fresh, &counts) {
                touched.push(self.open_or_merge(&baseline.device_id, finding).await);
            }
        }
        touched
    }

    /// Pattern checks against the current baselines, then a rebuild.
    pub async fn run_baseline_cycle(&self) {
        self.check_patterns().await;
        self.rebuild_baselines().await;
    }

    /// Auto-resolve stale low-severity anomalies and purge old resolved ones.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let now = self.clock.now();
        let stale_before = now - self.config.auto_resolve_after();
        let purge_before = now - self.config.retention();
        let mut report = MaintenanceReport::default();

        let mut anomalies = self.anomalies.write().await;
        for anomaly in anomalies.iter_mut() {
            if anomaly.is_open()
                && anomaly.severity == crate::anomaly::Severity::Low
                && anomaly.updated_at < stale_before
            {
                anomaly.resolve(now);
                report.auto_resolved += 1;
            }
        }
        let before = anomalies.len();
        anomalies.retain(|a| match a.resolved_at {
            Some(at) if a.resolved => at >= purge_before,
            _ => true,
        });
        report.purged = before - anomalies.len();
        drop(anomalies);

        if report != MaintenanceReport::default() {
            tracing::info!(
                category = "anomaly",
                auto_resolved = report.auto_resolved,
                purged = report.purged,
                "Anomaly maintenance"
            );
        }
        report
    }

    /// All anomalies, newest first.
    pub async fn list_anomalies(&self) -> Vec<Anomaly> {
        let mut all = self.anomalies.read().await.clone();
        all.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        all
    }

    pub async fn list_open_anomalies(&self) -> Vec<Anomaly> {
        let mut open: Vec<Anomaly> = self
            .anomalies
            .read()
            .await
            .iter()
            .filter(|a| a.is_open())
            .cloned()
            .collect();
        open.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        open
    }

    pub async fn anomalies_for_device(&self, device_id: &str) -> Vec<Anomaly> {
        self.list_anomalies()
            .await
            .into_iter()
            .filter(|a| a.device_id == device_id)
            .collect()
    }

    pub async fn open_count(&self, device_id: &str, anomaly_type: AnomalyType) -> usize {
        self.anomalies
            .read()
            .await
            .iter()
            .filter(|a| a.is_open() && a.device_id == device_id && a.anomaly_type == anomaly_type)
            .count()
    }

    pub async fn get_anomaly(&self, id: &str) -> Option<Anomaly> {
        self.anomalies.read().await.iter().find(|a| a.id == id).cloned()
    }

    /// Mark an anomaly resolved. Resolving twice keeps the first timestamp.
    pub async fn resolve_anomaly(&self, id: &str) -> Result<Anomaly> {
        let now = self.clock.now();
        let mut anomalies = self.anomalies.write().await;
        let anomaly = anomalies
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| Error::NotFound(format!("anomaly {}", id)))?;
        if anomaly.is_open() {
            anomaly.resolve(now);
            tracing::info!(category = "anomaly", anomaly_id = %id, device_id = %anomaly.device_id, "Anomaly resolved");
        }
        Ok(anomaly.clone())
    }

    /// Seed history from the store and build initial baselines.
    pub async fn bootstrap(&self, store: &dyn TelemetryStore) -> Result<usize> {
        let to = self.clock.now();
        let from = to - self.config.history_window();
        let mut loaded = 0;
        for device_id in store.device_ids().await? {
            let readings = store.query_range(&device_id, from, to).await?;
            loaded += readings.len();
            for reading in &readings {
                self.record(reading);
            }
        }
        let built = self.rebuild_baselines().await;
        tracing::info!(category = "anomaly", readings = loaded, baselines = built, "Anomaly history bootstrapped");
        Ok(loaded)
    }

    /// Subscribe to readings and schedule the periodic passes.
    pub async fn start(self: &Arc<Self>, scheduler: &Scheduler) {
        let mut readings = self.bus.subscribe_readings();
        let detector = self.clone();
        scheduler
            .spawn("anomaly-intake", async move {
                while let Some(reading) = readings.recv().await {
                    detector.process_reading(&reading).await;
                }
            })
            .await;

        let detector = self.clone();
        scheduler
            .spawn_periodic("anomaly-baselines", self.config.baseline_interval(), move || {
                let detector = detector.clone();
                async move { detector.run_baseline_cycle().await }
            })
            .await;

        let detector = self.clone();
        scheduler
            .spawn_periodic("anomaly-maintenance", self.config.maintenance_interval(), move || {
                let detector = detector.clone();
                async move {
                    detector.run_maintenance().await;
                }
            })
            .await;
        tracing::info!(category = "anomaly", sensitivity = ?self.config.sensitivity, "Anomaly detector started");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::{Sensitivity, Severity};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use gridmind_core::{Clock, EventBus, ManualClock};

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 19, 0, 0).unwrap()
    }

    fn detector(clock: &ManualClock) -> (AnomalyDetector, SharedEventBus) {
        let bus = Arc::new(EventBus::new());
        let config = AnomalyConfig {
            min_data_points: 10,
            ..Default::default()
        };
        (AnomalyDetector::new(config, Arc::new(clock.clone()), bus.clone()), bus)
    }

    fn flat(level: f64, std_dev: f64) -> BaselinePattern {
        BaselinePattern {
            device_id: "oven".into(),
            hourly_mean: [level; HOURS],
            hourly_samples: [5; HOURS],
            global_mean: level,
            std_dev,
            threshold: std_dev * Sensitivity::Medium.multiplier(),
            sensitivity: Sensitivity::Medium,
            sample_count: 120,
            confidence: 1.0,
            built_at: start_time(),
        }
    }

    #[tokio::test]
    async fn test_spike_scenario_at_19() {
        let clock = ManualClock::new(start_time());
        let (detector, bus) = detector(&clock);
        let mut events = bus.subscribe_filtered(|e| matches!(e, GridEvent::AnomalyDetected { .. }));
        detector.set_baseline(flat(100.0, 10.0)).await;

        let touched = detector
            .process_reading(&Reading::new("oven", start_time(), 450.0))
            .await;
        assert_eq!(touched.len(), 1);
        let anomaly = &touched[0];
        assert_eq!(anomaly.anomaly_type, AnomalyType::Spike);
        assert_eq!(anomaly.severity, Severity::Critical);
        assert!((anomaly.deviation_pct - 350.0).abs() < 1e-9);

        let (event, meta) = events.recv().await.unwrap();
        assert!(matches!(event, GridEvent::AnomalyDetected { ref severity, .. } if severity == "critical"));
        assert_eq!(meta.source, "anomaly");
    }

    #[tokio::test]
    async fn test_spikes_within_window_deduplicated() {
        let clock = ManualClock::new(start_time());
        let (detector, _bus) = detector(&clock);
        detector.set_baseline(flat(100.0, 10.0)).await;

        detector.process_reading(&Reading::new("oven", clock.now(), 450.0)).await;
        clock.advance(Duration::minutes(5));
        detector.process_reading(&Reading::new("oven", clock.now(), 200.0)).await;

        let open = detector.list_open_anomalies().await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].occurrences, 2);
        assert_eq!(open[0].confidence, 0.95);
        assert_eq!(open[0].severity, Severity::Critical);

        // Outside the window a new record opens
        clock.advance(Duration::minutes(6));
        detector.process_reading(&Reading::new("oven", clock.now(), 450.0)).await;
        assert_eq!(detector.open_count("oven", AnomalyType::Spike).await, 2);
    }

    #[tokio::test]
    async fn test_auto_resolve_and_purge() {
        let clock = ManualClock::new(start_time());
        let (detector, _bus) = detector(&clock);
        // Threshold 1 W so a 40% excursion is a low-severity spike
        detector.set_baseline(flat(100.0, 0.5)).await;

        let low = detector
            .process_reading(&Reading::new("oven", clock.now(), 140.0))
            .await
            .remove(0);
        assert_eq!(low.severity, Severity::Low);
        clock.advance(Duration::minutes(11));
        let high = detector
            .process_reading(&Reading::new("oven", clock.now(), 450.0))
            .await
            .remove(0);

        clock.advance(Duration::minutes(31));
        let report = detector.run_maintenance().await;
        assert_eq!(report.auto_resolved, 1);
        assert!(detector.get_anomaly(&low.id).await.unwrap().resolved);
        assert!(detector.get_anomaly(&high.id).await.unwrap().is_open());

        detector.resolve_anomaly(&high.id).await.unwrap();
        clock.advance(Duration::days(8));
        let report = detector.run_maintenance().await;
        assert_eq!(report.purged, 2);
        assert!(detector.list_anomalies().await.is_empty());
        assert!(matches!(detector.resolve_anomaly(&high.id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_baseline_built_from_history() {
        let clock = ManualClock::new(start_time());
        let (detector, _bus) = detector(&clock);
        for i in 0..9 {
            detector.record(&Reading::new("fridge", start_time() + Duration::minutes(i), 80.0));
        }
        assert_eq!(detector.rebuild_baselines().await, 0);

        detector.record(&Reading::new("fridge", start_time() + Duration::minutes(9), 80.0));
        assert_eq!(detector.rebuild_baselines().await, 1);
        let baseline = detector.baseline("fridge").await.unwrap();
        assert_eq!(baseline.expected_at(19), 80.0);
        assert_eq!(baseline.confidence, 0.5);
    }

    #[tokio::test]
    async fn test_history_window_trims_old_readings() {
        let clock = ManualClock::new(start_time());
        let (detector, _bus) = detector(&clock);
        detector.record(&Reading::new("m", start_time() - Duration::days(8), 1.0));
        detector.record(&Reading::new("m", start_time(), 1.0));
        assert_eq!(detector.history_len("m"), 1);
    }

    #[tokio::test]
    async fn test_pattern_deviation_from_last_day() {
        let clock = ManualClock::new(start_time());
        let (detector, _bus) = detector(&clock);
        detector.set_baseline(flat(100.0, 1000.0)).await;
        for h in 0..8 {
            let ts = start_time() - Duration::hours(h);
            detector.record(&Reading::new("oven", ts, 350.0));
        }
        let touched = detector.check_patterns().await;
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].anomaly_type, AnomalyType::PatternDeviation);
        assert_eq!(touched[0].severity, Severity::Medium);
    }

    #[tokio::test]
    async fn test_bootstrap_from_store() {
        let clock = ManualClock::new(start_time());
        let (detector, _bus) = detector(&clock);
        let store = gridmind_core::InMemoryTelemetryStore::new();
        for i in 0..12 {
            store
                .store(&Reading::new("boiler", start_time() - Duration::minutes(i), 2000.0))
                .await
                .unwrap();
        }
        assert_eq!(detector.bootstrap(&store).await.unwrap(), 12);
        assert!(detector.baseline("boiler").await.is_some());
    }
}
