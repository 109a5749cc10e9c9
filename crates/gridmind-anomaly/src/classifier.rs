//! Detection checks.
//!
//! Each check is a pure function over a baseline and recent data, returning
//! at most one [`Finding`].

use crate::anomaly::{AnomalyType, Finding, Severity};
use crate::baseline::{mean, regression_slope, BaselinePattern, HOURS};

/// Threshold units above the hourly mean that make a spike.
pub const SPIKE_FACTOR: f64 = 3.0;
/// Threshold units below the hourly mean that make a drop.
pub const DROP_FACTOR: f64 = 2.5;
/// Drops are ignored on slots averaging this many watts or less.
pub const DROP_MIN_BASELINE_W: f64 = 10.0;
/// Mean relative slot deviation that makes a pattern deviation.
pub const PATTERN_DEVIATION_LIMIT: f64 = 2.0;
/// Hourly slots both profiles must cover before comparing them.
pub const PATTERN_MIN_SLOTS: usize = 6;
/// Power-factor regression slope per reading, relative to the window mean,
/// below which efficiency is degrading.
pub const EFFICIENCY_SLOPE_LIMIT: f64 = -0.15;
pub const EFFICIENCY_MIN_POINTS: usize = 20;
/// Multiple of the hourly mean that is unusual at night.
pub const NIGHT_FACTOR: f64 = 2.0;

/// Local hours counted as night: 23:00 up to 05:00.
pub fn is_night(hour: u32) -> bool {
    hour >= 23 || hour < 5
}

pub fn check_spike(baseline: &BaselinePattern, hour: u32, power: f64) -> Option<Finding> {
    let expected = baseline.expected_at(hour);
    if power <= expected + baseline.threshold * SPIKE_FACTOR {
        return None;
    }
    let deviation = (power - expected) / expected.max(1.0) * 100.0;
    let severity = if deviation > 200.0 {
        Severity::Critical
    } else if deviation > 100.0 {
        Severity::High
    } else if deviation > 50.0 {
        Severity::Medium
    } else {
        Severity::Low
    };
    Some(Finding {
        anomaly_type: AnomalyType::Spike,
        severity,
        observed: power,
        expected,
        deviation_pct: deviation,
        confidence: (deviation / 100.0).min(0.95),
        description: format!(
            "Power {:.1} W is {:.0}% above the {:02}:00 baseline of {:.1} W",
            power, deviation, hour, expected
        ),
    })
}

pub fn check_drop(baseline: &BaselinePattern, hour: u32, power: f64) -> Option<Finding> {
    let expected = baseline.expected_at(hour);
    if expected <= DROP_MIN_BASELINE_W || power >= expected - baseline.threshold * DROP_FACTOR {
        return None;
    }
    let deviation = (expected - power) / expected * 100.0;
    let severity = if deviation >= 90.0 {
        Severity::High
    } else if deviation > 50.0 {
        Severity::Medium
    } else {
        Severity::Low
    };
    Some(Finding {
        anomaly_type: AnomalyType::Drop,
        severity,
        observed: power,
        expected,
        deviation_pct: deviation,
        confidence: (deviation / 100.0).min(0.95),
        description: format!(
            "Power {:.1} W is {:.0}% below the {:02}:00 baseline of {:.1} W",
            power, deviation, hour, expected
        ),
    })
}

pub fn check_unusual_timing(baseline: &BaselinePattern, hour: u32, power: f64) -> Option<Finding> {
    if !is_night(hour) {
        return None;
    }
    let expected = baseline.expected_at(hour).max(1.0);
    if power <= expected * NIGHT_FACTOR {
        return None;
    }
    let deviation = (power - expected) / expected * 100.0;
    let severity = if deviation > 300.0 {
        Severity::High
    } else {
        Severity::Medium
    };
    Some(Finding {
        anomaly_type: AnomalyType::UnusualTiming,
        severity,
        observed: power,
        expected,
        deviation_pct: deviation,
        confidence: (deviation / 300.0).min(0.9),
        description: format!(
            "Drawing {:.1} W at {:02}:00, more than twice the usual {:.1} W",
            power, hour, expected
        ),
    })
}

/// Compare a fresh 24-slot profile against the stored one.
///
/// `fresh` holds per-hour means of the last day and `fresh_samples` how many
/// readings back each slot; only slots covered by both sides count.
pub fn check_pattern_deviation(
    baseline: &BaselinePattern,
    fresh: &[f64; HOURS],
    fresh_samples: &[usize; HOURS],
) -> Option<Finding> {
    let deviations: Vec<f64> = (0..HOURS)
        .filter(|&h| fresh_samples[h] > 0 && baseline.hourly_samples[h] > 0)
        .map(|h| {
            let expected = baseline.hourly_mean[h];
            (fresh[h] - expected).abs() / expected.abs().max(1.0)
        })
        .collect();
    if deviations.len() < PATTERN_MIN_SLOTS {
        return None;
    }

    let average = mean(&deviations);
    if average <= PATTERN_DEVIATION_LIMIT {
        return None;
    }
    let severity = if average > 5.0 {
        Severity::Critical
    } else if average > 3.5 {
        Severity::High
    } else {
        Severity::Medium
    };
    let covered: Vec<f64> = (0..HOURS)
        .filter(|&h| fresh_samples[h] > 0 && baseline.hourly_samples[h] > 0)
        .map(|h| fresh[h])
        .collect();
    Some(Finding {
        anomaly_type: AnomalyType::PatternDeviation,
        severity,
        observed: mean(&covered),
        expected: baseline.global_mean,
        deviation_pct: average * 100.0,
        confidence: (average / 5.0).min(0.9),
        description: format!(
            "Daily profile deviates {:.0}% from baseline across {} hours",
            average * 100.0,
            deviations.len()
        ),
    })
}

/// Detect a sustained decline in power factor.
///
/// The regression slope over the window, normalized by the window mean.
pub fn check_efficiency_loss(power_factors: &[f64]) -> Option<Finding> {
    if power_factors.len() < EFFICIENCY_MIN_POINTS {
        return None;
    }
    let average = mean(power_factors);
    if average <= 0.0 {
        return None;
    }
    let slope = regression_slope(power_factors);
    let relative = slope / average;
    if relative >= EFFICIENCY_SLOPE_LIMIT {
        return None;
    }
    let severity = if relative < -0.4 {
        Severity::High
    } else if relative < -0.25 {
        Severity::Medium
    } else {
        Severity::Low
    };
    let last = power_factors.last().copied().unwrap_or(average);
    Some(Finding {
        anomaly_type: AnomalyType::EfficiencyLoss,
        severity,
        observed: last,
        expected: average,
        deviation_pct: relative * 100.0,
        confidence: (relative.abs() / 0.3).min(0.95),
        description: format!(
            "Power factor falling {:.0}% of its mean per reading over the last {} readings",
            relative.abs() * 100.0,
            power_factors.len()
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::Sensitivity;
    use chrono::Utc;

    fn flat_baseline(level: f64, threshold: f64) -> BaselinePattern {
        BaselinePattern {
            device_id: "m".into(),
            hourly_mean: [level; HOURS],
            hourly_samples: [10; HOURS],
            global_mean: level,
            std_dev: threshold / 2.0,
            threshold,
            sensitivity: Sensitivity::Medium,
            sample_count: 240,
            confidence: 1.0,
            built_at: Utc::now(),
        }
    }

    #[test]
    fn test_spike_scenario_critical() {
        // 100 W at 19:00, std dev 10 W, medium sensitivity
        let baseline = flat_baseline(100.0, 20.0);
        let finding = check_spike(&baseline, 19, 450.0).unwrap();
        assert_eq!(finding.severity, Severity::Critical);
        assert!((finding.deviation_pct - 350.0).abs() < 1e-9);
        assert_eq!(finding.confidence, 0.95);

        assert!(check_spike(&baseline, 19, 160.0).is_none());
        let medium = check_spike(&baseline, 19, 161.0).unwrap();
        assert_eq!(medium.severity, Severity::Medium);
    }

    #[test]
    fn test_spike_severity_bands() {
        let baseline = flat_baseline(100.0, 1.0);
        let sev = |p| check_spike(&baseline, 12, p).unwrap().severity;
        assert_eq!(sev(140.0), Severity::Low);
        assert_eq!(sev(180.0), Severity::Medium);
        assert_eq!(sev(250.0), Severity::High);
        assert_eq!(sev(301.0), Severity::Critical);
    }

    #[test]
    fn test_drop_requires_meaningful_baseline() {
        let baseline = flat_baseline(400.0, 20.0);
        let finding = check_drop(&baseline, 10, 20.0).unwrap();
        assert_eq!(finding.severity, Severity::High);
        assert!(check_drop(&baseline, 10, 360.0).is_none());

        let tiny = flat_baseline(8.0, 0.5);
        assert!(check_drop(&tiny, 10, 0.0).is_none());
    }

    #[test]
    fn test_unusual_timing_only_at_night() {
        let baseline = flat_baseline(50.0, 5.0);
        assert!(check_unusual_timing(&baseline, 14, 500.0).is_none());
        let finding = check_unusual_timing(&baseline, 2, 150.0).unwrap();
        assert_eq!(finding.severity, Severity::Medium);
        let finding = check_unusual_timing(&baseline, 23, 250.0).unwrap();
        assert_eq!(finding.severity, Severity::High);
        assert!(check_unusual_timing(&baseline, 5, 500.0).is_none());
    }

    #[test]
    fn test_pattern_deviation() {
        let baseline = flat_baseline(100.0, 10.0);
        let mut fresh = [100.0; HOURS];
        let mut samples = [0usize; HOURS];
        for h in 0..5 {
            fresh[h] = 600.0;
            samples[h] = 4;
        }
        // Five slots are not enough to judge
        assert!(check_pattern_deviation(&baseline, &fresh, &samples).is_none());

        fresh[5] = 600.0;
        samples[5] = 4;
        let finding = check_pattern_deviation(&baseline, &fresh, &samples).unwrap();
        assert_eq!(finding.severity, Severity::High);
        assert!((finding.deviation_pct - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_efficiency_loss() {
        let stable = vec![0.95; 30];
        assert!(check_efficiency_loss(&stable).is_none());

        // a gradual decline stays well above the per-reading limit
        let gradual: Vec<f64> = (0..20).map(|i| 0.95 - 0.015 * i as f64).collect();
        assert!(check_efficiency_loss(&gradual).is_none());

        // collapse after two good readings: relative slope about -0.22
        let mut collapsed = vec![0.95, 0.95];
        collapsed.extend(std::iter::repeat(0.02).take(18));
        let finding = check_efficiency_loss(&collapsed).unwrap();
        assert_eq!(finding.anomaly_type, AnomalyType::EfficiencyLoss);
        assert_eq!(finding.severity, Severity::Low);
        assert!((finding.deviation_pct + 22.28).abs() < 0.01);
        assert!(check_efficiency_loss(&collapsed[..19]).is_none());
    }
}
