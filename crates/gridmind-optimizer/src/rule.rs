//! Optimization rules.
//!
//! ```toml
//! [[optimizer.rules]]
//! id = "peak_shaving_evening"
//! rule_type = "peak_shaving"
//! priority = 1
//! conditions = [
//!     { type = "time_range", start = "18:00", end = "22:00" },
//!     { type = "power_above", watts = 5000.0 },
//! ]
//! actions = [{ type = "reduce_power", ratio = 0.2, max_reduction_w = 1000.0 }]
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use gridmind_core::DeviceType;

use crate::error::{OptimizerError, Result};
use crate::window::TimeWindow;

/// Setpoint assumed for HVAC devices never commanded before.
pub const DEFAULT_SETPOINT_C: f64 = 21.0;

/// Largest setpoint offset a rule may request.
pub const MAX_SETPOINT_OFFSET_C: f64 = 5.0;

/// Longest load deferral a rule may request.
pub const MAX_SHIFT_HOURS: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    PeakShaving,
    StandbyCutoff,
    CostCeiling,
    LoadShifting,
    Comfort,
    #[default]
    Custom,
}

/// When a rule applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Local time inside the window
    TimeRange(TimeWindow),
    /// Aggregate power strictly above the threshold
    PowerAbove { watts: f64 },
    /// Aggregate power strictly below the threshold
    PowerBelow { watts: f64 },
    /// Current cost per hour strictly above the threshold
    CostAbove { per_hour: f64 },
    /// At least one online device of these types; also restricts targets
    DeviceTypes { types: Vec<DeviceType> },
}

/// Kind of action, without parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ReducePower,
    AdjustSetpoint,
    TurnOff,
    ShiftLoad,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        ActionKind::ReducePower,
        ActionKind::AdjustSetpoint,
        ActionKind::TurnOff,
        ActionKind::ShiftLoad,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReducePower => "reduce_power",
            Self::AdjustSetpoint => "adjust_setpoint",
            Self::TurnOff => "turn_off",
            Self::ShiftLoad => "shift_load",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One action of a rule, with its magnitude cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionSpec {
    /// Cut `ratio` of current power, at most `max_reduction_w`
    ReducePower { ratio: f64, max_reduction_w: f64 },
    /// Move the setpoint by `offset_c`, clamped to `max_offset_c`
    AdjustSetpoint { offset_c: f64, max_offset_c: f64 },
    /// Switch off; optionally only devices idling below `standby_below_w`
    TurnOff {
        #[serde(default)]
        standby_below_w: Option<f64>,
    },
    /// Switch off now, back on after `hours`
    ShiftLoad { hours: u32 },
}

impl ActionSpec {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::ReducePower { .. } => ActionKind::ReducePower,
            Self::AdjustSetpoint { .. } => ActionKind::AdjustSetpoint,
            Self::TurnOff { .. } => ActionKind::TurnOff,
            Self::ShiftLoad { .. } => ActionKind::ShiftLoad,
        }
    }

    fn validate(&self, rule_id: &str) -> Result<()> {
        let invalid = |msg: String| Err(OptimizerError::invalid(rule_id, msg));
        match *self {
            Self::ReducePower { ratio, max_reduction_w } => {
                if !(ratio > 0.0 && ratio <= 1.0) {
                    return invalid(format!("reduce_power ratio {} not in (0, 1]", ratio));
                }
                if !(max_reduction_w.is_finite() && max_reduction_w > 0.0) {
                    return invalid(format!("max_reduction_w {} must be positive", max_reduction_w));
                }
            }
            Self::AdjustSetpoint { offset_c, max_offset_c } => {
                if !(max_offset_c > 0.0 && max_offset_c <= MAX_SETPOINT_OFFSET_C) {
                    return invalid(format!(
                        "max_offset_c {} not in (0, {}]",
                        max_offset_c, MAX_SETPOINT_OFFSET_C
                    ));
                }
                if !offset_c.is_finite() || offset_c == 0.0 {
                    return invalid("setpoint offset must be a non-zero number".to_string());
                }
            }
            Self::TurnOff { standby_below_w } => {
                if let Some(w) = standby_below_w {
                    if !(w.is_finite() && w > 0.0) {
                        return invalid(format!("standby_below_w {} must be positive", w));
                    }
                }
            }
            Self::ShiftLoad { hours } => {
                if hours == 0 || hours > MAX_SHIFT_HOURS {
                    return invalid(format!("shift_load hours {} not in 1..={}", hours, MAX_SHIFT_HOURS));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRule {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub rule_type: RuleType,

    /// Lower runs first
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// All must hold
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Tried in order per target device; the first that applies is used
    pub actions: Vec<ActionSpec>,

    /// Devices acted on per evaluation
    #[serde(default = "default_max_targets")]
    pub max_targets: usize,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Order actions by the learned action-value table
    #[serde(default)]
    pub learning: bool,
}

fn default_priority() -> u32 {
    100
}

fn default_max_targets() -> usize {
    3
}

fn default_true() -> bool {
    true
}

impl OptimizationRule {
    pub fn new(id: impl Into<String>, rule_type: RuleType, priority: u32) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            rule_type,
            priority,
            conditions: Vec::new(),
            actions: Vec::new(),
            max_targets: default_max_targets(),
            enabled: true,
            learning: false,
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_action(mut self, action: ActionSpec) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_max_targets(mut self, max: usize) -> Self {
        self.max_targets = max;
        self
    }

    pub fn with_learning(mut self, learning: bool) -> Self {
        self.learning = learning;
        self
    }

    /// Device types the rule is restricted to, if any.
    pub fn device_types(&self) -> Option<&[DeviceType]> {
        self.conditions.iter().find_map(|c| match c {
            Condition::DeviceTypes { types } => Some(types.as_slice()),
            _ => None,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(OptimizerError::invalid("<empty>", "rule id must not be empty"));
        }
        if self.actions.is_empty() {
            return Err(OptimizerError::invalid(&self.id, "at least one action is required"));
        }
        if self.max_targets == 0 {
            return Err(OptimizerError::invalid(&self.id, "max_targets must be at least 1"));
        }
        for condition in &self.conditions {
            match condition {
                Condition::PowerAbove { watts } | Condition::PowerBelow { watts } if !watts.is_finite() => {
                    return Err(OptimizerError::invalid(&self.id, "power threshold must be finite"));
                }
                Condition::CostAbove { per_hour } if !(per_hour.is_finite() && *per_hour >= 0.0) => {
                    return Err(OptimizerError::invalid(&self.id, "cost threshold must be non-negative"));
                }
                Condition::DeviceTypes { types } if types.is_empty() => {
                    return Err(OptimizerError::invalid(&self.id, "device type filter is empty"));
                }
                _ => {}
            }
        }
        for action in &self.actions {
            action.validate(&self.id)?;
        }
        Ok(())
    }
}

/// Rules installed when none are configured.
pub fn default_rules() -> Vec<OptimizationRule> {
    vec![
        OptimizationRule::new("peak_shaving_evening", RuleType::PeakShaving, 1)
            .with_condition(Condition::TimeRange(TimeWindow::hours(18, 22)))
            .with_condition(Condition::PowerAbove { watts: 5000.0 })
            .with_action(ActionSpec::ReducePower {
                ratio: 0.2,
                max_reduction_w: 1000.0,
            })
            .with_learning(true),
        OptimizationRule::new("night_standby_cutoff", RuleType::StandbyCutoff, 2)
            .with_condition(Condition::TimeRange(TimeWindow::hours(1, 5)))
            .with_condition(Condition::DeviceTypes {
                types: vec![DeviceType::SmartPlug, DeviceType::Appliance],
            })
            .with_action(ActionSpec::TurnOff {
                standby_below_w: Some(15.0),
            })
            .with_max_targets(10),
        OptimizationRule::new("cost_ceiling_trim", RuleType::CostCeiling, 3)
            .with_condition(Condition::CostAbove { per_hour: 2.0 })
            .with_action(ActionSpec::ReducePower {
                ratio: 0.1,
                max_reduction_w: 500.0,
            })
            .with_action(ActionSpec::AdjustSetpoint {
                offset_c: -1.0,
                max_offset_c: 2.0,
            })
            .with_learning(true),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules_are_valid_and_ordered() {
        let rules = default_rules();
        let ids: Vec<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["peak_shaving_evening", "night_standby_cutoff", "cost_ceiling_trim"]);
        for rule in &rules {
            rule.validate().unwrap();
        }
        assert_eq!(
            rules[1].device_types(),
            Some(&[DeviceType::SmartPlug, DeviceType::Appliance][..])
        );
    }

    #[test]
    fn test_rule_from_toml() {
        let rule: OptimizationRule = toml::from_str(
            r#"
            id = "hvac_comfort"
            rule_type = "comfort"
            priority = 5
            conditions = [
                { type = "time_range", start = "13:00", end = "17:00" },
                { type = "device_types", types = ["hvac"] },
            ]
            actions = [{ type = "adjust_setpoint", offset_c = 1.5, max_offset_c = 2.0 }]
            "#,
        )
        .unwrap();
        assert_eq!(rule.rule_type, RuleType::Comfort);
        assert_eq!(rule.max_targets, 3);
        assert!(rule.enabled);
        assert!(matches!(rule.conditions[0], Condition::TimeRange(_)));
        rule.validate().unwrap();
    }

    #[test]
    fn test_validation_bounds() {
        let bad_ratio = OptimizationRule::new("r", RuleType::Custom, 1).with_action(ActionSpec::ReducePower {
            ratio: 1.5,
            max_reduction_w: 100.0,
        });
        assert!(matches!(bad_ratio.validate(), Err(OptimizerError::InvalidRule { .. })));

        let no_actions = OptimizationRule::new("r", RuleType::Custom, 1);
        assert!(no_actions.validate().is_err());

        let long_shift = OptimizationRule::new("r", RuleType::LoadShifting, 1)
            .with_action(ActionSpec::ShiftLoad { hours: 48 });
        assert!(long_shift.validate().is_err());

        let big_offset = OptimizationRule::new("r", RuleType::Comfort, 1).with_action(ActionSpec::AdjustSetpoint {
            offset_c: 1.0,
            max_offset_c: 9.0,
        });
        assert!(big_offset.validate().is_err());
    }
}
