//! Periodic load balancing.
//!
//! Every pass looks at each online device's peak draw over a trailing
//! window. Devices whose peak exceeds the fleet average by more than the
//! tolerance get a power cut sized by the configured strategy. Cuts go
//! through the engine so they share its confidence scoring, history,
//! cooldowns and learning.

use std::sync::Arc;

use gridmind_core::{DeviceType, Scheduler, SharedTelemetryStore};

use crate::actions::device_power;
use crate::config::{BalancingStrategy, LoadBalancingConfig};
use crate::engine::OptimizationEngine;
use crate::learning::StateKey;
use crate::result::OptimizationResult;
use crate::rule::{ActionKind, ActionSpec};

/// Rule id recorded on load-balancing results.
pub const LOAD_BALANCING_RULE: &str = "load_balancing";

/// Fleet average and the indices of devices above `average × (1 + tolerance)`.
pub fn over_average(peaks: &[f64], tolerance: f64) -> Option<(f64, Vec<usize>)> {
    if peaks.len() < 2 {
        return None;
    }
    let average = peaks.iter().sum::<f64>() / peaks.len() as f64;
    let limit = average * (1.0 + tolerance);
    let over: Vec<usize> = peaks
        .iter()
        .enumerate()
        .filter(|(_, p)| **p > limit)
        .map(|(i, _)| i)
        .collect();
    if over.is_empty() {
        None
    } else {
        Some((average, over))
    }
}

/// Watts to cut per over-average device.
pub fn planned_cuts(strategy: BalancingStrategy, peaks: &[f64], tolerance: f64) -> Vec<(usize, f64)> {
    let Some((average, over)) = over_average(peaks, tolerance) else {
        return Vec::new();
    };
    match strategy {
        BalancingStrategy::RoundRobin => {
            let excess: f64 = over.iter().map(|i| peaks[*i] - average).sum();
            let share = excess / over.len() as f64;
            over.into_iter().map(|i| (i, share)).collect()
        }
        BalancingStrategy::AverageTrim | BalancingStrategy::Learned => {
            over.into_iter().map(|i| (i, peaks[i] - average)).collect()
        }
    }
}

pub struct LoadBalancer {
    config: LoadBalancingConfig,
    engine: Arc<OptimizationEngine>,
    store: SharedTelemetryStore,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancingConfig, engine: Arc<OptimizationEngine>, store: SharedTelemetryStore) -> Self {
        Self { config, engine, store }
    }

    pub fn config(&self) -> &LoadBalancingConfig {
        &self.config
    }

    /// Run one balancing pass and return the actions attempted.
    pub async fn balance_once(&self) -> Vec<OptimizationResult> {
        let snapshot = self.engine.snapshot().await;
        let now = snapshot.taken_at;
        let from = now - self.config.window();

        // Meters measure aggregates, not loads that can be cut.
        let candidates: Vec<_> = snapshot
            .devices
            .iter()
            .filter(|d| d.device_type != DeviceType::Meter)
            .collect();

        let mut peaks = Vec::with_capacity(candidates.len());
        for device in &candidates {
            let history = match self.store.query_range(&device.id, from, now).await {
                Ok(history) => history,
                Err(e) => {
                    tracing::warn!(category = "balancer", device_id = %device.id, error = %e, "Peak query failed");
                    Vec::new()
                }
            };
            let peak = history
                .iter()
                .map(|r| r.power_w)
                .filter(|p| p.is_finite())
                .fold(device_power(device), f64::max);
            peaks.push(peak);
        }

        let cuts = planned_cuts(self.config.strategy, &peaks, self.config.tolerance);
        if cuts.is_empty() {
            tracing::debug!(category = "balancer", devices = peaks.len(), "Load balanced");
            return Vec::new();
        }

        let mut results = Vec::new();
        for (index, cut) in cuts {
            let device = candidates[index];
            if self.engine.in_cooldown(LOAD_BALANCING_RULE, &device.id, now) {
                continue;
            }
            let power = device_power(device);
            let cut = cut.min(self.config.max_reduction_w);
            if power <= 0.0 || cut <= 0.0 {
                continue;
            }

            let reduce = ActionSpec::ReducePower {
                ratio: (cut / power).min(1.0),
                max_reduction_w: cut,
            };
            let turn_off = ActionSpec::TurnOff { standby_below_w: None };
            let state = StateKey::new(LOAD_BALANCING_RULE, device.device_type, power);

            let specs: Vec<&ActionSpec> = match self.config.strategy {
                BalancingStrategy::Learned => {
                    let chosen = self
                        .engine
                        .qtable()
                        .choose(&state, &[ActionKind::ReducePower, ActionKind::TurnOff]);
                    if chosen == Some(ActionKind::TurnOff) {
                        vec![&turn_off, &reduce]
                    } else {
                        vec![&reduce, &turn_off]
                    }
                }
                _ => vec![&reduce],
            };

            if let Some(result) = self
                .engine
                .try_actions(LOAD_BALANCING_RULE, &specs, device, &snapshot, state)
                .await
            {
                results.push(result);
            }
        }

        tracing::info!(
            category = "balancer",
            strategy = ?self.config.strategy,
            actions = results.len(),
            "Load balancing pass complete"
        );
        results
    }

    pub async fn start(self: &Arc<Self>, scheduler: &Scheduler) {
        let balancer = self.clone();
        scheduler
            .spawn_periodic("load-balancer", self.config.interval(), move || {
                let balancer = balancer.clone();
                async move {
                    balancer.balance_once().await;
                }
            })
            .await;
        tracing::info!(category = "balancer", interval_secs = self.config.interval_secs, "Load balancer started");
    }
}
