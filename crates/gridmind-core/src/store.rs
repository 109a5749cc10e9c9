//! Injected telemetry persistence.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::reading::Reading;

/// Append-only time-series store for readings.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Append one reading.
    async fn store(&self, reading: &Reading) -> Result<()>;

    /// Readings for `device_id` with `from <= timestamp <= to`, oldest first.
    async fn query_range(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>>;

    /// Ids of every device with at least one stored reading.
    async fn device_ids(&self) -> Result<Vec<String>>;
}

pub type SharedTelemetryStore = Arc<dyn TelemetryStore>;

/// Volatile store, optionally capped per device.
pub struct InMemoryTelemetryStore {
    series: RwLock<HashMap<String, Vec<Reading>>>,
    max_per_device: Option<usize>,
}

impl InMemoryTelemetryStore {
    pub fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            max_per_device: None,
        }
    }

    /// Keep at most `max` readings per device, oldest evicted first.
    pub fn with_retention(max: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            max_per_device: Some(max.max(1)),
        }
    }

    pub async fn len(&self, device_id: &str) -> usize {
        self.series
            .read()
            .await
            .get(device_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for InMemoryTelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetryStore for InMemoryTelemetryStore {
    async fn store(&self, reading: &Reading) -> Result<()> {
        let mut series = self.series.write().await;
        let entries = series.entry(reading.device_id.clone()).or_default();

        // Keep entries sorted; readings almost always arrive in order.
        let pos = entries.partition_point(|r| r.timestamp <= reading.timestamp);
        entries.insert(pos, reading.clone());

        if let Some(max) = self.max_per_device {
            if entries.len() > max {
                let excess = entries.len() - max;
                entries.drain(..excess);
            }
        }
        Ok(())
    }

    async fn query_range(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        let series = self.series.read().await;
        Ok(series
            .get(device_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|r| r.timestamp >= from && r.timestamp <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn device_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.series.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_query_range_inclusive_and_ordered() {
        let store = InMemoryTelemetryStore::new();
        let t0 = Utc::now();
        for offset in [2, 0, 1, 3] {
            store
                .store(&Reading::new("m", t0 + Duration::seconds(offset), offset as f64))
                .await
                .unwrap();
        }
        store.store(&Reading::new("other", t0, 9.0)).await.unwrap();

        let got = store
            .query_range("m", t0 + Duration::seconds(1), t0 + Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(got.iter().map(|r| r.power_w).collect::<Vec<_>>(), vec![1.0, 2.0]);
        assert!(store
            .query_range("missing", t0, t0)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.device_ids().await.unwrap(), vec!["m", "other"]);
    }

    #[tokio::test]
    async fn test_retention_evicts_oldest() {
        let store = InMemoryTelemetryStore::with_retention(2);
        let t0 = Utc::now();
        for i in 0..5 {
            store
                .store(&Reading::new("m", t0 + Duration::seconds(i), i as f64))
                .await
                .unwrap();
        }
        assert_eq!(store.len("m").await, 2);
        let all = store
            .query_range("m", t0, t0 + Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(all[0].power_w, 3.0);
    }
}
