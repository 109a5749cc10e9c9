//! Statistical anomaly detection over device telemetry.
//!
//! Each device gets a 24-slot hourly baseline built from its rolling
//! history. Incoming readings are checked for spikes, drops and night-time
//! activity against that baseline; power-factor trends and whole-day
//! profile shifts are checked separately.

pub mod anomaly;
pub mod baseline;
pub mod classifier;
pub mod config;
pub mod detector;

pub use anomaly::{Anomaly, AnomalyType, Finding, Sensitivity, Severity};
pub use baseline::{baseline_confidence, BaselinePattern};
pub use config::AnomalyConfig;
pub use detector::{AnomalyDetector, MaintenanceReport};
