//! `[optimizer]` and `[load_balancing]` configuration sections.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use gridmind_core::config::{require_positive, require_range, ConfigError};

use crate::learning::LearningConfig;
use crate::rule::{default_rules, OptimizationRule};
use crate::tariff::Tariff;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between evaluation cycles
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Results kept in memory
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Actions scored below this are skipped
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Seconds before a rule may act on the same device again
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Site power at which load counts as full
    #[serde(default = "default_site_capacity")]
    pub site_capacity_w: f64,

    /// Install the built-in rules alongside configured ones
    #[serde(default = "default_true")]
    pub default_rules: bool,

    #[serde(default)]
    pub rules: Vec<OptimizationRule>,

    #[serde(default)]
    pub tariff: Tariff,

    #[serde(default)]
    pub learning: LearningConfig,
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    30
}

fn default_max_history() -> usize {
    1000
}

fn default_min_confidence() -> f64 {
    0.3
}

fn default_cooldown() -> u64 {
    300
}

fn default_site_capacity() -> f64 {
    10_000.0
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval(),
            max_history: default_max_history(),
            min_confidence: default_min_confidence(),
            cooldown_secs: default_cooldown(),
            site_capacity_w: default_site_capacity(),
            default_rules: true,
            rules: Vec::new(),
            tariff: Tariff::default(),
            learning: LearningConfig::default(),
        }
    }
}

impl OptimizerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }

    /// Built-in rules (unless disabled) followed by configured ones. A
    /// configured rule replaces a built-in with the same id.
    pub fn initial_rules(&self) -> Vec<OptimizationRule> {
        let mut rules: Vec<OptimizationRule> = if self.default_rules {
            default_rules()
                .into_iter()
                .filter(|d| !self.rules.iter().any(|r| r.id == d.id))
                .collect()
        } else {
            Vec::new()
        };
        rules.extend(self.rules.iter().cloned());
        rules
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("optimizer.interval_secs", self.interval_secs)?;
        require_positive("optimizer.max_history", self.max_history as u64)?;
        require_range("optimizer.min_confidence", self.min_confidence, 0.0, 1.0)?;
        if !(self.site_capacity_w.is_finite() && self.site_capacity_w > 0.0) {
            return Err(ConfigError::invalid("optimizer.site_capacity_w", "must be positive"));
        }
        self.tariff
            .validate()
            .map_err(|e| ConfigError::invalid("optimizer.tariff", e))?;
        self.learning
            .validate()
            .map_err(|e| ConfigError::invalid("optimizer.learning", e))?;

        let mut seen = HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.id.as_str()) {
                return Err(ConfigError::invalid(
                    "optimizer.rules",
                    format!("duplicate rule id '{}'", rule.id),
                ));
            }
            rule.validate()
                .map_err(|e| ConfigError::invalid("optimizer.rules", e.to_string()))?;
        }
        Ok(())
    }
}

/// How over-average load is redistributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategy {
    /// Equal share of the total excess per over-average device
    #[default]
    RoundRobin,
    /// ε-greedy choice from the learned table
    Learned,
    /// Trim each device down to the fleet average
    AverageTrim,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_balance_interval")]
    pub interval_secs: u64,

    /// Trailing window for per-device peaks
    #[serde(default = "default_balance_window")]
    pub window_secs: u64,

    /// Allowed deviation above the fleet average, as a fraction
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    #[serde(default)]
    pub strategy: BalancingStrategy,

    /// Largest cut applied to one device per pass
    #[serde(default = "default_max_reduction")]
    pub max_reduction_w: f64,
}

fn default_balance_interval() -> u64 {
    300
}

fn default_balance_window() -> u64 {
    900
}

fn default_tolerance() -> f64 {
    0.1
}

fn default_max_reduction() -> f64 {
    1000.0
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_balance_interval(),
            window_secs: default_balance_window(),
            tolerance: default_tolerance(),
            strategy: BalancingStrategy::default(),
            max_reduction_w: default_max_reduction(),
        }
    }
}

impl LoadBalancingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs as i64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("load_balancing.interval_secs", self.interval_secs)?;
        require_positive("load_balancing.window_secs", self.window_secs)?;
        require_range("load_balancing.tolerance", self.tolerance, 0.0, 10.0)?;
        if !(self.max_reduction_w.is_finite() && self.max_reduction_w > 0.0) {
            return Err(ConfigError::invalid("load_balancing.max_reduction_w", "must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleType;

    #[test]
    fn test_defaults() {
        let config: OptimizerConfig = toml::from_str("").unwrap();
        assert_eq!(config, OptimizerConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.initial_rules().len(), 3);

        let balancing: LoadBalancingConfig = toml::from_str("strategy = \"average_trim\"").unwrap();
        assert_eq!(balancing.strategy, BalancingStrategy::AverageTrim);
        assert_eq!(balancing.window(), chrono::Duration::minutes(15));
    }

    #[test]
    fn test_configured_rule_overrides_builtin() {
        let config: OptimizerConfig = toml::from_str(
            r#"
            interval_secs = 10

            [tariff]
            flat_rate = 0.25

            [[rules]]
            id = "peak_shaving_evening"
            rule_type = "peak_shaving"
            priority = 1
            conditions = [{ type = "power_above", watts = 3000.0 }]
            actions = [{ type = "reduce_power", ratio = 0.5, max_reduction_w = 400.0 }]
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        let rules = config.initial_rules();
        assert_eq!(rules.len(), 3);
        let peak = rules.iter().find(|r| r.id == "peak_shaving_evening").unwrap();
        assert_eq!(peak.conditions.len(), 1);
        assert_eq!(peak.rule_type, RuleType::PeakShaving);
    }

    #[test]
    fn test_duplicate_rules_rejected() {
        let rule = OptimizationRule::new("dup", RuleType::Custom, 1)
            .with_action(crate::rule::ActionSpec::ShiftLoad { hours: 1 });
        let config = OptimizerConfig {
            rules: vec![rule.clone(), rule],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }
}
