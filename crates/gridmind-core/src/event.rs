//! Events published on the GridMind event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::{DeviceStatus, DeviceType, Protocol};
use crate::reading::Reading;

/// Event metadata attached to every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event id
    pub event_id: String,
    /// Component that published the event (`poller`, `listener`, …)
    pub source: String,
    /// Publish time
    pub published_at: DateTime<Utc>,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            published_at: Utc::now(),
        }
    }
}

/// Everything that happens in the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GridEvent {
    /// New normalized telemetry sample
    Reading(Reading),

    /// A device was added to the registry
    DeviceDiscovered {
        device_id: String,
        device_type: DeviceType,
        protocol: Protocol,
    },

    /// Device transitioned to Online
    DeviceOnline {
        device_id: String,
        previous: DeviceStatus,
    },

    /// Device transitioned to Offline
    DeviceOffline { device_id: String, reason: String },

    /// Device explicitly removed
    DeviceRemoved { device_id: String },

    /// A command finished, successfully or not
    CommandCompleted {
        device_id: String,
        action: String,
        success: bool,
        error: Option<String>,
    },

    /// The anomaly detector opened or updated an anomaly
    AnomalyDetected {
        anomaly_id: String,
        device_id: String,
        anomaly_type: String,
        severity: String,
        confidence: f64,
    },

    /// The optimizer attempted an action
    OptimizationApplied {
        rule_id: String,
        device_id: String,
        action: String,
        success: bool,
        estimated_savings_w: f64,
    },
}

impl GridEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Reading(_) => "Reading",
            Self::DeviceDiscovered { .. } => "DeviceDiscovered",
            Self::DeviceOnline { .. } => "DeviceOnline",
            Self::DeviceOffline { .. } => "DeviceOffline",
            Self::DeviceRemoved { .. } => "DeviceRemoved",
            Self::CommandCompleted { .. } => "CommandCompleted",
            Self::AnomalyDetected { .. } => "AnomalyDetected",
            Self::OptimizationApplied { .. } => "OptimizationApplied",
        }
    }

    /// Device the event concerns.
    pub fn device_id(&self) -> &str {
        match self {
            Self::Reading(r) => &r.device_id,
            Self::DeviceDiscovered { device_id, .. }
            | Self::DeviceOnline { device_id, .. }
            | Self::DeviceOffline { device_id, .. }
            | Self::DeviceRemoved { device_id }
            | Self::CommandCompleted { device_id, .. }
            | Self::AnomalyDetected { device_id, .. }
            | Self::OptimizationApplied { device_id, .. } => device_id,
        }
    }

    pub fn is_reading(&self) -> bool {
        matches!(self, Self::Reading(_))
    }

    pub fn is_device_event(&self) -> bool {
        matches!(
            self,
            Self::DeviceDiscovered { .. }
                | Self::DeviceOnline { .. }
                | Self::DeviceOffline { .. }
                | Self::DeviceRemoved { .. }
        )
    }
}
