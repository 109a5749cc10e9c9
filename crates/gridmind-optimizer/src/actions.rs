//! Turning an [`ActionSpec`] into a concrete device command.
//!
//! Planning is pure: it looks at the device snapshot and decides what to
//! send, the before/after values, and the estimated savings. Nothing here
//! touches the network.

use chrono::Duration;

use gridmind_core::command::SETPOINT_RANGE_C;
use gridmind_core::{Capability, Device, DeviceCommand};

use crate::error::{OptimizerError, Result};
use crate::rule::{ActionKind, ActionSpec, DEFAULT_SETPOINT_C};

/// Share of device power saved per °C of setpoint change.
pub const SETPOINT_SAVINGS_PER_C: f64 = 0.05;

/// A command ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAction {
    pub kind: ActionKind,
    pub command: DeviceCommand,
    /// Watts, or °C for setpoint changes
    pub before: f64,
    pub after: f64,
    pub estimated_savings_w: f64,
    /// Switch back on after this long (load shifting)
    pub resume_after: Option<Duration>,
}

fn not_applicable(device: &Device, reason: impl Into<String>) -> OptimizerError {
    OptimizerError::NotApplicable {
        device_id: device.id.clone(),
        reason: reason.into(),
    }
}

/// Current draw, never negative.
pub fn device_power(device: &Device) -> f64 {
    device.current_power().filter(|p| p.is_finite()).unwrap_or(0.0).max(0.0)
}

/// Power after cutting `ratio` of `power`.
///
/// The total cut never exceeds `max_reduction_w` and the result is never
/// negative. A device cap pulls the result further down, but only as far as
/// `power - max_reduction_w`.
pub fn reduced_power(power: f64, ratio: f64, max_reduction_w: f64, cap: Option<f64>) -> f64 {
    let power = power.max(0.0);
    let max_reduction_w = max_reduction_w.max(0.0);
    let floor = (power - max_reduction_w).max(0.0);
    let reduction = (power * ratio.clamp(0.0, 1.0)).min(max_reduction_w);
    let target = (power - reduction).max(0.0);
    match cap {
        Some(cap) => target.min(cap.max(0.0)).max(floor),
        None => target,
    }
}

pub fn plan(spec: &ActionSpec, device: &Device) -> Result<PlannedAction> {
    match *spec {
        ActionSpec::ReducePower { ratio, max_reduction_w } => plan_reduce(device, ratio, max_reduction_w),
        ActionSpec::AdjustSetpoint { offset_c, max_offset_c } => plan_setpoint(device, offset_c, max_offset_c),
        ActionSpec::TurnOff { standby_below_w } => {
            let power = check_switchable(device)?;
            if let Some(limit) = standby_below_w {
                if power >= limit {
                    return Err(not_applicable(device, format!("{:.1} W is not standby", power)));
                }
            }
            Ok(PlannedAction {
                kind: ActionKind::TurnOff,
                command: DeviceCommand::TurnOff,
                before: power,
                after: 0.0,
                estimated_savings_w: power,
                resume_after: None,
            })
        }
        ActionSpec::ShiftLoad { hours } => {
            let power = check_switchable(device)?;
            if power <= 0.0 {
                return Err(not_applicable(device, "no load to shift"));
            }
            Ok(PlannedAction {
                kind: ActionKind::ShiftLoad,
                command: DeviceCommand::TurnOff,
                before: power,
                after: 0.0,
                estimated_savings_w: power,
                resume_after: Some(Duration::hours(hours as i64)),
            })
        }
    }
}

fn plan_reduce(device: &Device, ratio: f64, max_reduction_w: f64) -> Result<PlannedAction> {
    let power = device_power(device);
    if power <= 0.0 {
        return Err(not_applicable(device, "no load to reduce"));
    }
    let target = reduced_power(power, ratio, max_reduction_w, device.max_power_w);

    let command = if device.supports(Capability::PowerLimit) {
        DeviceCommand::SetPowerLimit { watts: target }
    } else if device.supports(Capability::Dimmer) {
        let current = device.commanded.brightness.unwrap_or(100).min(100) as f64;
        let level = (current * target / power).round().clamp(0.0, 100.0) as u8;
        DeviceCommand::SetBrightness { level }
    } else {
        return Err(not_applicable(device, "no power limit or dimmer"));
    };

    Ok(PlannedAction {
        kind: ActionKind::ReducePower,
        command,
        before: power,
        after: target,
        estimated_savings_w: power - target,
        resume_after: None,
    })
}

fn plan_setpoint(device: &Device, offset_c: f64, max_offset_c: f64) -> Result<PlannedAction> {
    if !device.supports(Capability::Setpoint) {
        return Err(not_applicable(device, "no setpoint"));
    }
    let (min, max) = SETPOINT_RANGE_C;
    let before = device.commanded.setpoint_c.unwrap_or(DEFAULT_SETPOINT_C);
    let limit = max_offset_c.abs();
    let after = (before + offset_c.clamp(-limit, limit)).clamp(min, max);
    let applied = (after - before).abs();
    if applied == 0.0 {
        return Err(not_applicable(device, "setpoint already at its limit"));
    }

    Ok(PlannedAction {
        kind: ActionKind::AdjustSetpoint,
        command: DeviceCommand::SetSetpoint { celsius: after },
        before,
        after,
        estimated_savings_w: device_power(device) * SETPOINT_SAVINGS_PER_C * applied,
        resume_after: None,
    })
}

fn check_switchable(device: &Device) -> Result<f64> {
    if device.essential {
        return Err(not_applicable(device, "device is essential"));
    }
    if !device.supports(Capability::Switch) {
        return Err(not_applicable(device, "no relay"));
    }
    if device.commanded.relay_on == Some(false) {
        return Err(not_applicable(device, "already off"));
    }
    Ok(device_power(device))
}
