//! Normalized telemetry sample.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single normalized telemetry sample from one device.
///
/// Every adapter converts its wire format into this shape. Quantities a
/// device does not report are left at `0.0` (or `None` for temperature);
/// power factor defaults to `1.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Device that produced the sample
    pub device_id: String,
    /// Sample time
    pub timestamp: DateTime<Utc>,
    /// Active power in watts
    pub power_w: f64,
    /// RMS voltage in volts
    pub voltage_v: f64,
    /// RMS current in amperes
    pub current_a: f64,
    /// Cumulative imported energy in kWh
    pub energy_kwh: f64,
    /// Grid frequency in Hz
    pub frequency_hz: f64,
    /// Power factor (0..=1)
    pub power_factor: f64,
    /// Device temperature in °C, if reported
    pub temperature_c: Option<f64>,
}

impl Reading {
    /// Create a reading with only power set.
    pub fn new(device_id: impl Into<String>, timestamp: DateTime<Utc>, power_w: f64) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            power_w,
            voltage_v: 0.0,
            current_a: 0.0,
            energy_kwh: 0.0,
            frequency_hz: 0.0,
            power_factor: 1.0,
            temperature_c: None,
        }
    }

    pub fn with_voltage(mut self, volts: f64) -> Self {
        self.voltage_v = volts;
        self
    }

    pub fn with_current(mut self, amps: f64) -> Self {
        self.current_a = amps;
        self
    }

    pub fn with_energy(mut self, kwh: f64) -> Self {
        self.energy_kwh = kwh;
        self
    }

    pub fn with_frequency(mut self, hz: f64) -> Self {
        self.frequency_hz = hz;
        self
    }

    pub fn with_power_factor(mut self, pf: f64) -> Self {
        self.power_factor = pf.clamp(0.0, 1.0);
        self
    }

    pub fn with_temperature(mut self, celsius: f64) -> Self {
        self.temperature_c = Some(celsius);
        self
    }

    /// Reject samples that cannot come from a physical device.
    ///
    /// Negative power is allowed: bidirectional meters report net export
    /// that way.
    pub fn is_plausible(&self) -> bool {
        let finite = [
            self.power_w,
            self.voltage_v,
            self.current_a,
            self.energy_kwh,
            self.frequency_hz,
            self.power_factor,
        ]
        .iter()
        .all(|v| v.is_finite());

        finite && self.voltage_v >= 0.0 && self.current_a >= 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let r = Reading::new("plug-1", Utc::now(), 42.0)
            .with_voltage(230.1)
            .with_power_factor(1.7);
        assert_eq!(r.power_w, 42.0);
        assert_eq!(r.voltage_v, 230.1);
        assert_eq!(r.power_factor, 1.0);
        assert!(r.temperature_c.is_none());
        assert!(r.is_plausible());
    }

    #[test]
    fn test_implausible_values() {
        let r = Reading::new("plug-1", Utc::now(), f64::NAN);
        assert!(!r.is_plausible());
        let r = Reading::new("plug-1", Utc::now(), 10.0).with_voltage(-230.0);
        assert!(!r.is_plausible());
        let r = Reading::new("meter-1", Utc::now(), -1500.0);
        assert!(r.is_plausible());
    }
}
