//! Tabular action-value learning.
//!
//! State is a structured key (rule, device class, power bucket); actions are
//! [`ActionKind`]s. Updates follow `Q += α(r + γ·max Q(s',·) − Q)`.

use std::sync::Mutex;

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use gridmind_core::DeviceType;

use crate::rule::ActionKind;

/// Coarse load class of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerBucket {
    Idle,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl PowerBucket {
    pub fn from_watts(watts: f64) -> Self {
        match watts {
            w if w < 10.0 => Self::Idle,
            w if w < 200.0 => Self::Low,
            w if w < 1000.0 => Self::Medium,
            w if w < 3000.0 => Self::High,
            _ => Self::VeryHigh,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub rule_id: String,
    pub device_class: DeviceType,
    pub bucket: PowerBucket,
}

impl StateKey {
    pub fn new(rule_id: impl Into<String>, device_class: DeviceType, power_w: f64) -> Self {
        Self {
            rule_id: rule_id.into(),
            device_class,
            bucket: PowerBucket::from_watts(power_w),
        }
    }

    /// Same rule and class, observed at a new power level.
    pub fn at_power(&self, power_w: f64) -> Self {
        Self {
            bucket: PowerBucket::from_watts(power_w),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    /// Exploration rate for learned load balancing
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Reward applied when an action fails
    #[serde(default = "default_failure_penalty")]
    pub failure_penalty: f64,
    /// Fixed seed for reproducible exploration
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_alpha() -> f64 {
    0.1
}

fn default_gamma() -> f64 {
    0.9
}

fn default_epsilon() -> f64 {
    0.1
}

fn default_failure_penalty() -> f64 {
    1.0
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            gamma: default_gamma(),
            epsilon: default_epsilon(),
            failure_penalty: default_failure_penalty(),
            seed: None,
        }
    }
}

impl LearningConfig {
    pub fn validate(&self) -> Result<(), String> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(format!("{} {} not in [0, 1]", name, v))
            }
        };
        unit("alpha", self.alpha)?;
        unit("gamma", self.gamma)?;
        unit("epsilon", self.epsilon)?;
        if !(self.failure_penalty.is_finite() && self.failure_penalty >= 0.0) {
            return Err(format!("failure_penalty {} must be non-negative", self.failure_penalty));
        }
        Ok(())
    }
}

/// Reward for an observed saving: kilowatts actually shed.
pub fn savings_reward(realized_savings_w: f64) -> f64 {
    if realized_savings_w.is_finite() {
        realized_savings_w / 1000.0
    } else {
        0.0
    }
}

pub struct QTable {
    config: LearningConfig,
    values: DashMap<(StateKey, ActionKind), f64>,
    rng: Mutex<StdRng>,
}

impl QTable {
    pub fn new(config: LearningConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            values: DashMap::new(),
            rng: Mutex::new(rng),
        }
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, state: &StateKey, action: ActionKind) -> f64 {
        self.values
            .get(&(state.clone(), action))
            .map(|v| *v)
            .unwrap_or(0.0)
    }

    pub fn best_value(&self, state: &StateKey) -> f64 {
        ActionKind::ALL
            .iter()
            .filter_map(|a| self.values.get(&(state.clone(), *a)).map(|v| *v))
            .fold(None, |best: Option<f64>, v| Some(best.map_or(v, |b| b.max(v))))
            .unwrap_or(0.0)
    }

    /// Apply one update and return the new value.
    pub fn update(&self, state: &StateKey, action: ActionKind, reward: f64, next: &StateKey) -> f64 {
        let future = self.best_value(next);
        let mut entry = self.values.entry((state.clone(), action)).or_insert(0.0);
        let q = *entry;
        *entry = q + self.config.alpha * (reward + self.config.gamma * future - q);
        tracing::debug!(
            category = "learning",
            rule_id = %state.rule_id,
            action = %action,
            reward,
            q = *entry,
            "Q updated"
        );
        *entry
    }

    pub fn penalize(&self, state: &StateKey, action: ActionKind) -> f64 {
        self.update(state, action, -self.config.failure_penalty, state)
    }

    /// Candidates ordered by value, best first. Ties keep their given order.
    pub fn rank(&self, state: &StateKey, candidates: &[ActionKind]) -> Vec<ActionKind> {
        let mut ranked: Vec<(ActionKind, f64)> = candidates.iter().map(|a| (*a, self.value(state, *a))).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.into_iter().map(|(a, _)| a).collect()
    }

    /// ε-greedy choice among `candidates`.
    pub fn choose(&self, state: &StateKey, candidates: &[ActionKind]) -> Option<ActionKind> {
        if candidates.is_empty() {
            return None;
        }
        let explore = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            if rng.gen::<f64>() < self.config.epsilon {
                Some(candidates[rng.gen_range(0..candidates.len())])
            } else {
                None
            }
        };
        explore.or_else(|| self.rank(state, candidates).first().copied())
    }
}
