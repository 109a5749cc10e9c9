//! redb-backed telemetry store.
//!
//! Readings live in one table keyed by `"{device_id}:{timestamp_ms}"` with
//! the millisecond timestamp zero-padded to 20 digits, so a lexicographic
//! range scan over one device prefix returns readings in time order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};

use gridmind_core::store::TelemetryStore;
use gridmind_core::Reading;

use crate::error::{Result, StorageError};

const READINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("readings");
const DEVICES_TABLE: TableDefinition<&str, u64> = TableDefinition::new("reading_devices");

fn reading_key(device_id: &str, timestamp: DateTime<Utc>) -> String {
    format!("{}:{:020}", device_id, timestamp.timestamp_millis().max(0))
}

/// Persistent telemetry store.
#[derive(Clone)]
pub struct RedbTelemetryStore {
    db: Arc<Database>,
}

impl RedbTelemetryStore {
    /// Open or create a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let db = if path_ref.exists() {
            Database::open(path_ref)?
        } else {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Database::create(path_ref)?
        };

        // Create tables up front so read transactions never miss them.
        let txn = db.begin_write()?;
        {
            txn.open_table(READINGS_TABLE)?;
            txn.open_table(DEVICES_TABLE)?;
        }
        txn.commit()?;

        tracing::info!(category = "storage", path = %path_ref.display(), "Telemetry store opened");
        Ok(Self { db: Arc::new(db) })
    }

    /// Append one reading.
    pub fn insert(&self, reading: &Reading) -> Result<()> {
        let key = reading_key(&reading.device_id, reading.timestamp);
        let value = serde_json::to_vec(reading)?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(READINGS_TABLE)?;
            table.insert(&*key, &*value)?;

            let mut devices = txn.open_table(DEVICES_TABLE)?;
            let count = devices
                .get(reading.device_id.as_str())?
                .map(|v| v.value())
                .unwrap_or(0);
            devices.insert(reading.device_id.as_str(), count + 1)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Readings in `[from, to]` for one device, oldest first.
    pub fn range(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        if to < from {
            return Ok(Vec::new());
        }
        let txn = self.db.begin_read()?;
        let table = txn.open_table(READINGS_TABLE)?;

        let start_key = reading_key(device_id, from);
        let end_key = reading_key(device_id, to);

        let mut results = Vec::new();
        for entry in table.range(&*start_key..=&*end_key)? {
            let (_key, value) = entry?;
            match serde_json::from_slice::<Reading>(value.value()) {
                Ok(reading) => results.push(reading),
                Err(e) => {
                    tracing::warn!(category = "storage", device_id = %device_id, error = %e, "Skipping undecodable reading");
                }
            }
        }
        Ok(results)
    }

    /// Devices with stored readings and their reading counts.
    pub fn devices(&self) -> Result<Vec<(String, u64)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DEVICES_TABLE)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            out.push((key.value().to_string(), value.value()));
        }
        Ok(out)
    }

    /// Delete readings older than `cutoff`. Returns how many were removed.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let devices: Vec<String> = self.devices()?.into_iter().map(|(id, _)| id).collect();
        let txn = self.db.begin_write()?;
        let mut removed = 0usize;
        {
            let mut table = txn.open_table(READINGS_TABLE)?;
            let mut counts = txn.open_table(DEVICES_TABLE)?;
            for device_id in devices {
                let start_key = format!("{}:{:020}", device_id, 0);
                let end_key = reading_key(&device_id, cutoff);
                let stale: Vec<String> = table
                    .range(&*start_key..&*end_key)?
                    .filter_map(|entry| entry.ok().map(|(k, _)| k.value().to_string()))
                    .collect();
                for key in &stale {
                    table.remove(key.as_str())?;
                }
                if !stale.is_empty() {
                    let count = counts
                        .get(device_id.as_str())?
                        .map(|v| v.value())
                        .unwrap_or(0);
                    let left = count.saturating_sub(stale.len() as u64);
                    if left == 0 {
                        counts.remove(device_id.as_str())?;
                    } else {
                        counts.insert(device_id.as_str(), left)?;
                    }
                }
                removed += stale.len();
            }
        }
        txn.commit()?;
        Ok(removed)
    }
}

#[async_trait]
impl TelemetryStore for RedbTelemetryStore {
    async fn store(&self, reading: &Reading) -> gridmind_core::Result<()> {
        let this = self.clone();
        let reading = reading.clone();
        tokio::task::spawn_blocking(move || this.insert(&reading))
            .await
            .map_err(StorageError::from)??;
        Ok(())
    }

    async fn query_range(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> gridmind_core::Result<Vec<Reading>> {
        let this = self.clone();
        let device_id = device_id.to_string();
        let readings = tokio::task::spawn_blocking(move || this.range(&device_id, from, to))
            .await
            .map_err(StorageError::from)??;
        Ok(readings)
    }

    async fn device_ids(&self) -> gridmind_core::Result<Vec<String>> {
        let this = self.clone();
        let devices = tokio::task::spawn_blocking(move || this.devices())
            .await
            .map_err(StorageError::from)??;
        Ok(devices.into_iter().map(|(id, _)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn temp_store() -> (tempfile::TempDir, RedbTelemetryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbTelemetryStore::open(dir.path().join("telemetry.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_range_is_per_device_and_ordered() {
        let (_dir, store) = temp_store();
        let t0 = Utc::now();
        for i in [3i64, 1, 2, 0] {
            store
                .insert(&Reading::new("meter", t0 + Duration::minutes(i), i as f64 * 100.0))
                .unwrap();
        }
        store.insert(&Reading::new("meter:2", t0, 5.0)).unwrap();
        store.insert(&Reading::new("met", t0, 6.0)).unwrap();

        let got = store
            .range("meter", t0 + Duration::minutes(1), t0 + Duration::minutes(3))
            .unwrap();
        let powers: Vec<f64> = got.iter().map(|r| r.power_w).collect();
        assert_eq!(powers, vec![100.0, 200.0, 300.0]);
        assert!(got.iter().all(|r| r.device_id == "meter"));

        let mut devices = store.devices().unwrap();
        devices.sort();
        assert_eq!(devices[1], ("meter".to_string(), 4));
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/t.redb");
        let t0 = Utc::now();
        {
            let store = RedbTelemetryStore::open(&path).unwrap();
            store.insert(&Reading::new("plug", t0, 42.0)).unwrap();
        }
        let store = RedbTelemetryStore::open(&path).unwrap();
        let got = store.range("plug", t0 - Duration::seconds(1), t0).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].power_w, 42.0);
    }

    #[test]
    fn test_prune_before() {
        let (_dir, store) = temp_store();
        let t0 = Utc::now();
        for i in 0..5 {
            store
                .insert(&Reading::new("m", t0 + Duration::hours(i), 1.0))
                .unwrap();
        }
        let removed = store.prune_before(t0 + Duration::hours(2)).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.devices().unwrap(), vec![("m".to_string(), 3)]);
    }

    #[tokio::test]
    async fn test_trait_object_roundtrip() {
        let (_dir, store) = temp_store();
        let store: Arc<dyn TelemetryStore> = Arc::new(store);
        let t0 = Utc::now();
        store.store(&Reading::new("kasa-1", t0, 7.5)).await.unwrap();
        let got = store
            .query_range("kasa-1", t0, t0 + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(store.device_ids().await.unwrap(), vec!["kasa-1"]);
    }
}
