//! Electricity tariff: a flat rate with optional time-of-use windows.
//!
//! ```toml
//! [optimizer.tariff]
//! flat_rate = 0.25
//!
//! [[optimizer.tariff.windows]]
//! start = "17:00"
//! end = "21:00"
//! rate = 0.42
//! ```

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::window::TimeWindow;

/// A time-of-use price window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouWindow {
    #[serde(flatten)]
    pub window: TimeWindow,
    /// Price per kWh inside the window
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tariff {
    /// Price per kWh outside every window
    #[serde(default = "default_flat_rate")]
    pub flat_rate: f64,

    /// First matching window wins
    #[serde(default)]
    pub windows: Vec<TouWindow>,
}

fn default_flat_rate() -> f64 {
    0.30
}

impl Default for Tariff {
    fn default() -> Self {
        Self::flat(default_flat_rate())
    }
}

impl Tariff {
    pub fn flat(rate: f64) -> Self {
        Self {
            flat_rate: rate,
            windows: Vec::new(),
        }
    }

    pub fn with_window(mut self, window: TimeWindow, rate: f64) -> Self {
        self.windows.push(TouWindow { window, rate });
        self
    }

    /// Price per kWh at a local time.
    pub fn rate_at(&self, time: NaiveTime) -> f64 {
        self.windows
            .iter()
            .find(|w| w.window.contains(time))
            .map(|w| w.rate)
            .unwrap_or(self.flat_rate)
    }

    /// Cost per hour of drawing `power_w` at `time`.
    pub fn cost_per_hour(&self, power_w: f64, time: NaiveTime) -> f64 {
        power_w.max(0.0) / 1000.0 * self.rate_at(time)
    }

    pub fn validate(&self) -> Result<(), String> {
        let valid = |r: f64| r.is_finite() && r >= 0.0;
        if !valid(self.flat_rate) {
            return Err(format!("flat_rate {} must be a non-negative number", self.flat_rate));
        }
        if let Some(w) = self.windows.iter().find(|w| !valid(w.rate)) {
            return Err(format!("window rate {} must be a non-negative number", w.rate));
        }
        Ok(())
    }
}
