//! `[anomaly]` configuration section.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use gridmind_core::config::{require_positive, ConfigError};

use crate::anomaly::Sensitivity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub sensitivity: Sensitivity,

    /// Samples required before a baseline is trusted
    #[serde(default = "default_min_data_points")]
    pub min_data_points: usize,

    /// Rolling history window used for baselines
    #[serde(default = "default_history_window_hours")]
    pub history_window_hours: u64,

    /// Hard cap on readings kept per device
    #[serde(default = "default_max_history")]
    pub max_history_per_device: usize,

    /// Seconds between baseline rebuilds (pattern checks run on the same tick)
    #[serde(default = "default_baseline_interval")]
    pub baseline_interval_secs: u64,

    /// Seconds between auto-resolve / purge passes
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    /// Repeated detections inside this window merge into one anomaly
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,

    /// Low-severity anomalies untouched this long are resolved
    #[serde(default = "default_auto_resolve")]
    pub auto_resolve_secs: u64,

    /// Resolved anomalies older than this are dropped
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    /// Readings in the power-factor trend window
    #[serde(default = "default_efficiency_window")]
    pub efficiency_window: usize,

    /// Seed history from the telemetry store at startup
    #[serde(default = "default_true")]
    pub bootstrap_from_store: bool,
}

fn default_true() -> bool {
    true
}

fn default_min_data_points() -> usize {
    50
}

fn default_history_window_hours() -> u64 {
    7 * 24
}

fn default_max_history() -> usize {
    20_000
}

fn default_baseline_interval() -> u64 {
    3600
}

fn default_maintenance_interval() -> u64 {
    60
}

fn default_dedup_window() -> u64 {
    600
}

fn default_auto_resolve() -> u64 {
    1800
}

fn default_retention_days() -> u64 {
    7
}

fn default_efficiency_window() -> usize {
    crate::classifier::EFFICIENCY_MIN_POINTS
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sensitivity: Sensitivity::default(),
            min_data_points: default_min_data_points(),
            history_window_hours: default_history_window_hours(),
            max_history_per_device: default_max_history(),
            baseline_interval_secs: default_baseline_interval(),
            maintenance_interval_secs: default_maintenance_interval(),
            dedup_window_secs: default_dedup_window(),
            auto_resolve_secs: default_auto_resolve(),
            retention_days: default_retention_days(),
            efficiency_window: default_efficiency_window(),
            bootstrap_from_store: true,
        }
    }
}

impl AnomalyConfig {
    pub fn history_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.history_window_hours as i64)
    }

    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dedup_window_secs as i64)
    }

    pub fn auto_resolve_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auto_resolve_secs as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days as i64)
    }

    pub fn baseline_interval(&self) -> Duration {
        Duration::from_secs(self.baseline_interval_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("anomaly.min_data_points", self.min_data_points as u64)?;
        require_positive("anomaly.history_window_hours", self.history_window_hours)?;
        require_positive("anomaly.baseline_interval_secs", self.baseline_interval_secs)?;
        require_positive("anomaly.maintenance_interval_secs", self.maintenance_interval_secs)?;
        if self.efficiency_window < crate::classifier::EFFICIENCY_MIN_POINTS {
            return Err(ConfigError::invalid(
                "anomaly.efficiency_window",
                format!("must be at least {}", crate::classifier::EFFICIENCY_MIN_POINTS),
            ));
        }
        if self.max_history_per_device < self.min_data_points {
            return Err(ConfigError::invalid(
                "anomaly.max_history_per_device",
                "must not be smaller than min_data_points",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_overrides() {
        let config: AnomalyConfig = toml::from_str("").unwrap();
        assert_eq!(config, AnomalyConfig::default());
        assert_eq!(config.dedup_window(), chrono::Duration::minutes(10));
        assert!(config.validate().is_ok());

        let config: AnomalyConfig = toml::from_str("sensitivity = \"high\"\nmin_data_points = 10").unwrap();
        assert_eq!(config.sensitivity, Sensitivity::High);
        assert_eq!(config.min_data_points, 10);
    }

    #[test]
    fn test_validation() {
        let config = AnomalyConfig {
            efficiency_window: 5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let config = AnomalyConfig {
            min_data_points: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
