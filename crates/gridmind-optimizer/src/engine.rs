//! Optimization engine.
//!
//! Each evaluation cycle:
//! 1. resumes shifted loads that are due,
//! 2. takes a snapshot of online devices, aggregate power, cost and load,
//! 3. settles pending rewards against fresh readings,
//! 4. runs every matching rule in priority order, acting on at most
//!    `max_targets` devices per rule through the command dispatcher.
//!
//! A device is acted on at most once per cycle, and a rule leaves a device
//! alone for `cooldown_secs` after acting on it.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use gridmind_core::{
    Device, DeviceCommand, DeviceType, GridEvent, Scheduler, SharedClock, SharedEventBus,
};
use gridmind_devices::{CommandDispatcher, SharedDeviceRegistry};

use crate::actions::{self, device_power, PlannedAction};
use crate::confidence::{load_factor, OutcomeStats};
use crate::config::OptimizerConfig;
use crate::error::{OptimizerError, Result};
use crate::learning::{savings_reward, QTable, StateKey};
use crate::result::{OptimizationResult, OptimizerStats};
use crate::rule::{ActionSpec, Condition, OptimizationRule};

const EVENT_SOURCE: &str = "optimizer";

/// Pending rewards older than this are dropped unsettled.
const REWARD_TTL_SECS: i64 = 3600;

/// System state seen by one evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub taken_at: DateTime<Utc>,
    pub local_time: NaiveTime,
    pub total_power_w: f64,
    pub online_devices: usize,
    pub cost_per_hour: f64,
    /// Aggregate power over site capacity, in `[0, 1]`
    pub load: f64,
    /// Online devices only
    pub devices: Vec<Device>,
}

impl SystemSnapshot {
    pub fn device(&self, device_id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == device_id)
    }

    fn has_type(&self, types: &[DeviceType]) -> bool {
        self.devices.iter().any(|d| types.contains(&d.device_type))
    }
}

pub fn condition_holds(condition: &Condition, snapshot: &SystemSnapshot) -> bool {
    match condition {
        Condition::TimeRange(window) => window.contains(snapshot.local_time),
        Condition::PowerAbove { watts } => snapshot.total_power_w > *watts,
        Condition::PowerBelow { watts } => snapshot.total_power_w < *watts,
        Condition::CostAbove { per_hour } => snapshot.cost_per_hour > *per_hour,
        Condition::DeviceTypes { types } => snapshot.has_type(types),
    }
}

pub fn rule_applies(rule: &OptimizationRule, snapshot: &SystemSnapshot) -> bool {
    rule.enabled && rule.conditions.iter().all(|c| condition_holds(c, snapshot))
}

#[derive(Debug, Clone)]
struct PendingReward {
    state: StateKey,
    action: crate::rule::ActionKind,
    device_id: String,
    power_before: f64,
    applied_at: DateTime<Utc>,
}

/// A shifted load waiting to be switched back on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredResume {
    pub rule_id: String,
    pub device_id: String,
    pub resume_at: DateTime<Utc>,
}

pub struct OptimizationEngine {
    config: OptimizerConfig,
    rules: RwLock<Vec<OptimizationRule>>,
    registry: SharedDeviceRegistry,
    dispatcher: Arc<CommandDispatcher>,
    clock: SharedClock,
    bus: SharedEventBus,
    results: RwLock<VecDeque<OptimizationResult>>,
    stats: RwLock<OptimizerStats>,
    outcomes: OutcomeStats,
    qtable: QTable,
    pending: Mutex<Vec<PendingReward>>,
    deferred: Mutex<Vec<DeferredResume>>,
    cooldowns: DashMap<(String, String), DateTime<Utc>>,
}

fn sort_rules(rules: &mut [OptimizationRule]) {
    rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
}

impl OptimizationEngine {
    pub fn new(
        config: OptimizerConfig,
        registry: SharedDeviceRegistry,
        dispatcher: Arc<CommandDispatcher>,
        clock: SharedClock,
        bus: SharedEventBus,
    ) -> Self {
        let mut rules: Vec<OptimizationRule> = config
            .initial_rules()
            .into_iter()
            .filter(|rule| match rule.validate() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(category = "optimizer", rule_id = %rule.id, error = %e, "Skipping invalid rule");
                    false
                }
            })
            .collect();
        sort_rules(&mut rules);

        Self {
            qtable: QTable::new(config.learning.clone()),
            config,
            rules: RwLock::new(rules),
            registry,
            dispatcher,
            clock,
            bus,
            results: RwLock::new(VecDeque::new()),
            stats: RwLock::new(OptimizerStats::default()),
            outcomes: OutcomeStats::new(),
            pending: Mutex::new(Vec::new()),
            deferred: Mutex::new(Vec::new()),
            cooldowns: DashMap::new(),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn qtable(&self) -> &QTable {
        &self.qtable
    }

    pub fn outcomes(&self) -> &OutcomeStats {
        &self.outcomes
    }

    // ========== Rules ==========

    pub async fn add_rule(&self, rule: OptimizationRule) -> Result<()> {
        rule.validate()?;
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(OptimizerError::DuplicateRule(rule.id));
        }
        tracing::info!(category = "optimizer", rule_id = %rule.id, priority = rule.priority, "Rule added");
        rules.push(rule);
        sort_rules(&mut rules);
        Ok(())
    }

    pub async fn update_rule(&self, rule: OptimizationRule) -> Result<()> {
        rule.validate()?;
        let mut rules = self.rules.write().await;
        let slot = rules
            .iter_mut()
            .find(|r| r.id == rule.id)
            .ok_or_else(|| OptimizerError::RuleNotFound(rule.id.clone()))?;
        *slot = rule;
        sort_rules(&mut rules);
        Ok(())
    }

    pub async fn remove_rule(&self, rule_id: &str) -> Result<OptimizationRule> {
        let mut rules = self.rules.write().await;
        let index = rules
            .iter()
            .position(|r| r.id == rule_id)
            .ok_or_else(|| OptimizerError::RuleNotFound(rule_id.to_string()))?;
        self.cooldowns.retain(|(rule, _), _| rule != rule_id);
        Ok(rules.remove(index))
    }

    pub async fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> Result<()> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| OptimizerError::RuleNotFound(rule_id.to_string()))?;
        rule.enabled = enabled;
        Ok(())
    }

    /// Rules in evaluation order.
    pub async fn list_rules(&self) -> Vec<OptimizationRule> {
        self.rules.read().await.clone()
    }

    pub async fn get_rule(&self, rule_id: &str) -> Option<OptimizationRule> {
        self.rules.read().await.iter().find(|r| r.id == rule_id).cloned()
    }

    // ========== Evaluation ==========

    pub async fn snapshot(&self) -> SystemSnapshot {
        let devices: Vec<Device> = self
            .registry
            .list_devices()
            .await
            .into_iter()
            .filter(|d| d.is_online())
            .collect();
        let total_power_w: f64 = devices.iter().map(device_power).sum();
        let local_time = self.clock.local_time();

        SystemSnapshot {
            taken_at: self.clock.now(),
            local_time,
            total_power_w,
            online_devices: devices.len(),
            cost_per_hour: self.config.tariff.cost_per_hour(total_power_w, local_time),
            load: load_factor(total_power_w, self.config.site_capacity_w),
            devices,
        }
    }

    /// Enabled rules whose conditions all hold, in priority order.
    pub async fn applicable_rules(&self, snapshot: &SystemSnapshot) -> Vec<OptimizationRule> {
        self.rules
            .read()
            .await
            .iter()
            .filter(|rule| rule_applies(rule, snapshot))
            .cloned()
            .collect()
    }

    /// Run one evaluation cycle and return the actions attempted.
    pub async fn evaluate_once(&self) -> Vec<OptimizationResult> {
        let now = self.clock.now();
        self.resume_deferred(now).await;

        let snapshot = self.snapshot().await;
        self.settle_rewards(&snapshot).await;

        let rules = self.applicable_rules(&snapshot).await;
        let mut touched: HashSet<String> = HashSet::new();
        let mut results = Vec::new();

        for rule in &rules {
            let mut acted = 0;
            for device in self.targets(rule, &snapshot, &touched, now) {
                if acted >= rule.max_targets {
                    break;
                }
                if let Some(result) = self.act_on(rule, device, &snapshot).await {
                    touched.insert(device.id.clone());
                    results.push(result);
                    acted += 1;
                }
            }
        }

        {
            let mut stats = self.stats.write().await;
            stats.evaluations += 1;
            stats.rules_matched += rules.len() as u64;
            stats.last_evaluation = Some(now);
        }
        tracing::debug!(
            category = "optimizer",
            total_power_w = snapshot.total_power_w,
            rules = rules.len(),
            actions = results.len(),
            "Evaluation cycle complete"
        );
        results
    }

    fn targets<'a>(
        &self,
        rule: &OptimizationRule,
        snapshot: &'a SystemSnapshot,
        touched: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Vec<&'a Device> {
        let types = rule.device_types();
        let mut targets: Vec<&Device> = snapshot
            .devices
            .iter()
            .filter(|d| types.map_or(true, |t| t.contains(&d.device_type)))
            .filter(|d| !touched.contains(&d.id))
            .filter(|d| !self.in_cooldown(&rule.id, &d.id, now))
            .collect();
        targets.sort_by(|a, b| {
            device_power(b)
                .total_cmp(&device_power(a))
                .then_with(|| a.id.cmp(&b.id))
        });
        targets
    }

    pub(crate) fn in_cooldown(&self, rule_id: &str, device_id: &str, now: DateTime<Utc>) -> bool {
        self.cooldowns
            .get(&(rule_id.to_string(), device_id.to_string()))
            .map(|at| now - *at < self.config.cooldown())
            .unwrap_or(false)
    }

    async fn act_on(
        &self,
        rule: &OptimizationRule,
        device: &Device,
        snapshot: &SystemSnapshot,
    ) -> Option<OptimizationResult> {
        let state = StateKey::new(rule.id.clone(), device.device_type, device_power(device));
        let mut ordered: Vec<&ActionSpec> = rule.actions.iter().collect();
        if rule.learning {
            ordered.sort_by(|a, b| {
                self.qtable
                    .value(&state, b.kind())
                    .total_cmp(&self.qtable.value(&state, a.kind()))
            });
        }
        self.try_actions(&rule.id, &ordered, device, snapshot, state).await
    }

    /// Plan each action in turn and execute the first one that applies
    /// with enough confidence.
    pub(crate) async fn try_actions(
        &self,
        rule_id: &str,
        specs: &[&ActionSpec],
        device: &Device,
        snapshot: &SystemSnapshot,
        state: StateKey,
    ) -> Option<OptimizationResult> {
        for spec in specs {
            let plan = match actions::plan(spec, device) {
                Ok(plan) => plan,
                Err(e) => {
                    tracing::trace!(category = "optimizer", rule_id = %rule_id, error = %e, "Action skipped");
                    continue;
                }
            };
            let confidence = self.outcomes.confidence(
                rule_id,
                plan.kind,
                &device.id,
                device.consecutive_failures,
                snapshot.load,
            );
            if confidence < self.config.min_confidence {
                self.stats.write().await.low_confidence_skips += 1;
                tracing::debug!(
                    category = "optimizer",
                    rule_id = %rule_id,
                    device_id = %device.id,
                    action = %plan.kind,
                    confidence,
                    "Confidence too low"
                );
                continue;
            }
            return Some(self.execute(rule_id, device, plan, confidence, state).await);
        }
        None
    }

    async fn execute(
        &self,
        rule_id: &str,
        device: &Device,
        plan: PlannedAction,
        confidence: f64,
        state: StateKey,
    ) -> OptimizationResult {
        let outcome = self
            .dispatcher
            .send_command(&device.id, plan.command.clone())
            .await
            .map(|_| ())
            .map_err(|e| {
                OptimizerError::ActionFailed {
                    device_id: device.id.clone(),
                    action: plan.kind.to_string(),
                    reason: e.to_string(),
                }
                .to_string()
            });
        let now = self.clock.now();
        let result = OptimizationResult::from_plan(rule_id, &device.id, &plan, confidence, outcome, now);

        self.outcomes.record(rule_id, plan.kind, &device.id, result.success);
        self.cooldowns
            .insert((rule_id.to_string(), device.id.clone()), now);

        if result.success {
            self.pending.lock().await.push(PendingReward {
                state,
                action: plan.kind,
                device_id: device.id.clone(),
                power_before: device_power(device),
                applied_at: now,
            });
            if let Some(delay) = plan.resume_after {
                self.deferred.lock().await.push(DeferredResume {
                    rule_id: rule_id.to_string(),
                    device_id: device.id.clone(),
                    resume_at: now + delay,
                });
            }
            tracing::info!(
                category = "optimizer",
                rule_id = %rule_id,
                device_id = %device.id,
                action = %plan.kind,
                before = plan.before,
                after = plan.after,
                savings_w = plan.estimated_savings_w,
                confidence,
                "Optimization applied"
            );
        } else {
            self.qtable.penalize(&state, plan.kind);
            tracing::warn!(
                category = "optimizer",
                rule_id = %rule_id,
                device_id = %device.id,
                action = %plan.kind,
                reason = %result.reason,
                "Optimization action failed"
            );
        }

        self.bus.publish(
            GridEvent::OptimizationApplied {
                rule_id: rule_id.to_string(),
                device_id: device.id.clone(),
                action: plan.kind.as_str().to_string(),
                success: result.success,
                estimated_savings_w: result.estimated_savings_w,
            },
            EVENT_SOURCE,
        );
        self.remember(result.clone()).await;
        result
    }

    async fn remember(&self, result: OptimizationResult) {
        {
            let mut stats = self.stats.write().await;
            stats.actions_attempted += 1;
            if result.success {
                stats.actions_succeeded += 1;
                stats.estimated_savings_w += result.estimated_savings_w;
            }
        }
        let mut results = self.results.write().await;
        results.push_back(result);
        while results.len() > self.config.max_history {
            results.pop_front();
        }
    }

    /// Feed realized savings back into the action-value table once a
    /// reading newer than the action is available.
    async fn settle_rewards(&self, snapshot: &SystemSnapshot) {
        let mut pending = self.pending.lock().await;
        pending.retain(|p| {
            let fresh = snapshot
                .device(&p.device_id)
                .and_then(|d| d.last_reading.as_ref())
                .filter(|r| r.timestamp > p.applied_at);
            match fresh {
                Some(reading) => {
                    let now_power = reading.power_w.max(0.0);
                    let reward = savings_reward(p.power_before - now_power);
                    self.qtable.update(&p.state, p.action, reward, &p.state.at_power(now_power));
                    false
                }
                None => snapshot.taken_at - p.applied_at < chrono::Duration::seconds(REWARD_TTL_SECS),
            }
        });
    }

    /// Switch shifted loads back on. Devices that are unreachable stay
    /// queued for the next cycle.
    async fn resume_deferred(&self, now: DateTime<Utc>) {
        let due: Vec<DeferredResume> = {
            let mut deferred = self.deferred.lock().await;
            let (due, waiting): (Vec<_>, Vec<_>) = deferred.drain(..).partition(|d| d.resume_at <= now);
            *deferred = waiting;
            due
        };

        for entry in due {
            match self.dispatcher.send_command(&entry.device_id, DeviceCommand::TurnOn).await {
                Ok(_) => {
                    tracing::info!(category = "optimizer", rule_id = %entry.rule_id, device_id = %entry.device_id, "Shifted load resumed");
                }
                Err(e) if e.affects_availability() => {
                    tracing::debug!(category = "optimizer", device_id = %entry.device_id, error = %e, "Resume postponed");
                    self.deferred.lock().await.push(entry);
                }
                Err(e) => {
                    tracing::warn!(category = "optimizer", device_id = %entry.device_id, error = %e, "Resume dropped");
                }
            }
        }
    }

    pub async fn deferred(&self) -> Vec<DeferredResume> {
        self.deferred.lock().await.clone()
    }

    // ========== Results ==========

    /// Attempted actions, newest first.
    pub async fn list_results(&self) -> Vec<OptimizationResult> {
        self.results.read().await.iter().rev().cloned().collect()
    }

    pub async fn results_for_rule(&self, rule_id: &str) -> Vec<OptimizationResult> {
        self.results
            .read()
            .await
            .iter()
            .rev()
            .filter(|r| r.rule_id == rule_id)
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> OptimizerStats {
        self.stats.read().await.clone()
    }

    /// Register the periodic evaluation task.
    pub async fn start(self: &Arc<Self>, scheduler: &Scheduler) {
        let engine = self.clone();
        scheduler
            .spawn_periodic("optimizer", self.config.interval(), move || {
                let engine = engine.clone();
                async move {
                    engine.evaluate_once().await;
                }
            })
            .await;
        tracing::info!(
            category = "optimizer",
            interval_secs = self.config.interval_secs,
            rules = self.rules.read().await.len(),
            "Optimization engine started"
        );
    }
}
