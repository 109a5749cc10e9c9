//! Optimization outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gridmind_core::DeviceCommand;

use crate::actions::PlannedAction;
use crate::rule::ActionKind;

/// One attempted optimization action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub id: Uuid,
    pub rule_id: String,
    pub device_id: String,
    pub action: ActionKind,
    pub command: DeviceCommand,
    /// Watts, or °C for setpoint changes
    pub before: f64,
    pub after: f64,
    pub estimated_savings_w: f64,
    pub confidence: f64,
    pub success: bool,
    /// Failure reason, or a note on what was done
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl OptimizationResult {
    pub fn from_plan(
        rule_id: &str,
        device_id: &str,
        plan: &PlannedAction,
        confidence: f64,
        outcome: std::result::Result<(), String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let (success, reason) = match outcome {
            Ok(()) => (true, format!("{} {:.1} -> {:.1}", plan.kind, plan.before, plan.after)),
            Err(reason) => (false, reason),
        };
        Self {
            id: Uuid::new_v4(),
            rule_id: rule_id.to_string(),
            device_id: device_id.to_string(),
            action: plan.kind,
            command: plan.command.clone(),
            before: plan.before,
            after: if success { plan.after } else { plan.before },
            estimated_savings_w: if success { plan.estimated_savings_w } else { 0.0 },
            confidence,
            success,
            reason,
            timestamp,
        }
    }
}

/// Counters across every evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerStats {
    pub evaluations: u64,
    pub rules_matched: u64,
    pub actions_attempted: u64,
    pub actions_succeeded: u64,
    pub low_confidence_skips: u64,
    pub estimated_savings_w: f64,
    pub last_evaluation: Option<DateTime<Utc>>,
}

impl OptimizerStats {
    pub fn success_rate(&self) -> f64 {
        if self.actions_attempted == 0 {
            0.0
        } else {
            self.actions_succeeded as f64 / self.actions_attempted as f64
        }
    }
}
