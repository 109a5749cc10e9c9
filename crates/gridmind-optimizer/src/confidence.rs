//! Confidence scoring for optimization actions.
//!
//! Confidence blends three signals:
//! - the historical success rate of the (rule, action) pair,
//! - how reliably the target device has executed recent actions,
//! - how loaded the site currently is.

use std::collections::VecDeque;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::rule::ActionKind;

const SUCCESS_WEIGHT: f64 = 0.5;
const STABILITY_WEIGHT: f64 = 0.3;
const LOAD_WEIGHT: f64 = 0.2;

/// Outcomes remembered per device for stability classification.
pub const DEVICE_OUTCOME_WINDOW: usize = 10;

/// How reliably a device executes commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stability {
    Stable,
    Variable,
    Unstable,
}

impl Stability {
    /// Classify from recent outcomes (true = success). No history is stable.
    pub fn classify(outcomes: &[bool], consecutive_failures: u32) -> Self {
        let failures = outcomes.iter().filter(|ok| !**ok).count();
        let rate = if outcomes.is_empty() {
            0.0
        } else {
            failures as f64 / outcomes.len() as f64
        };
        let stability = if rate <= 0.1 {
            Self::Stable
        } else if rate <= 0.3 {
            Self::Variable
        } else {
            Self::Unstable
        };
        if stability == Self::Stable && consecutive_failures > 0 {
            Self::Variable
        } else {
            stability
        }
    }

    pub fn score(&self) -> f64 {
        match self {
            Self::Stable => 1.0,
            Self::Variable => 0.6,
            Self::Unstable => 0.2,
        }
    }
}

/// Laplace-smoothed success rate; 0.5 with no history.
pub fn success_rate(successes: u32, attempts: u32) -> f64 {
    (successes as f64 + 1.0) / (attempts as f64 + 2.0)
}

/// Site load in `[0, 1]`.
pub fn load_factor(total_power_w: f64, site_capacity_w: f64) -> f64 {
    if site_capacity_w <= 0.0 || !total_power_w.is_finite() {
        return 0.0;
    }
    (total_power_w / site_capacity_w).clamp(0.0, 1.0)
}

pub fn blend(success: f64, stability: Stability, load: f64) -> f64 {
    let value = SUCCESS_WEIGHT * success + STABILITY_WEIGHT * stability.score() + LOAD_WEIGHT * load;
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionTally {
    pub attempts: u32,
    pub successes: u32,
}

/// Running outcome statistics behind the confidence score.
#[derive(Default)]
pub struct OutcomeStats {
    actions: DashMap<(String, ActionKind), ActionTally>,
    devices: DashMap<String, VecDeque<bool>>,
}

impl OutcomeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, rule_id: &str, action: ActionKind, device_id: &str, success: bool) {
        let mut tally = self.actions.entry((rule_id.to_string(), action)).or_default();
        tally.attempts += 1;
        if success {
            tally.successes += 1;
        }
        drop(tally);

        let mut outcomes = self.devices.entry(device_id.to_string()).or_default();
        outcomes.push_back(success);
        while outcomes.len() > DEVICE_OUTCOME_WINDOW {
            outcomes.pop_front();
        }
    }

    pub fn tally(&self, rule_id: &str, action: ActionKind) -> ActionTally {
        self.actions
            .get(&(rule_id.to_string(), action))
            .map(|t| *t)
            .unwrap_or_default()
    }

    pub fn stability(&self, device_id: &str, consecutive_failures: u32) -> Stability {
        let outcomes: Vec<bool> = self
            .devices
            .get(device_id)
            .map(|o| o.iter().copied().collect())
            .unwrap_or_default();
        Stability::classify(&outcomes, consecutive_failures)
    }

    pub fn confidence(
        &self,
        rule_id: &str,
        action: ActionKind,
        device_id: &str,
        consecutive_failures: u32,
        load: f64,
    ) -> f64 {
        let tally = self.tally(rule_id, action);
        blend(
            success_rate(tally.successes, tally.attempts),
            self.stability(device_id, consecutive_failures),
            load,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_action_confidence() {
        let stats = OutcomeStats::new();
        let c = stats.confidence("peak", ActionKind::ReducePower, "heater", 0, 0.6);
        assert!((c - 0.67).abs() < 1e-9);
    }

    #[test]
    fn test_failures_lower_confidence() {
        let stats = OutcomeStats::new();
        let fresh = stats.confidence("peak", ActionKind::TurnOff, "plug", 0, 0.5);
        for _ in 0..4 {
            stats.record("peak", ActionKind::TurnOff, "plug", false);
        }
        let burned = stats.confidence("peak", ActionKind::TurnOff, "plug", 0, 0.5);
        assert!(burned < fresh);
        assert_eq!(stats.stability("plug", 0), Stability::Unstable);
        assert_eq!(stats.tally("peak", ActionKind::TurnOff).attempts, 4);
    }

    #[test]
    fn test_stability_classes() {
        assert_eq!(Stability::classify(&[], 0), Stability::Stable);
        assert_eq!(Stability::classify(&[], 2), Stability::Variable);
        let mostly_ok = [true, true, true, true, false];
        assert_eq!(Stability::classify(&mostly_ok, 0), Stability::Variable);
        assert_eq!(Stability::classify(&[true; 10], 0), Stability::Stable);
    }

    #[test]
    fn test_bounds() {
        assert_eq!(load_factor(20_000.0, 10_000.0), 1.0);
        assert_eq!(load_factor(-5.0, 10_000.0), 0.0);
        assert_eq!(load_factor(100.0, 0.0), 0.0);
        assert_eq!(success_rate(0, 0), 0.5);
        assert!(blend(1.0, Stability::Stable, 1.0) <= 1.0);
        assert_eq!(blend(f64::NAN, Stability::Stable, 0.0), 0.0);
    }
}
