//! Per-device hourly baselines.

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};

use gridmind_core::Reading;

use crate::anomaly::Sensitivity;

pub const HOURS: usize = 24;

/// Expected power profile of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselinePattern {
    pub device_id: String,
    /// Mean power per local hour; hours without samples hold the global mean
    pub hourly_mean: [f64; HOURS],
    /// Samples behind each hourly slot
    pub hourly_samples: [usize; HOURS],
    pub global_mean: f64,
    /// Population standard deviation over all samples
    pub std_dev: f64,
    /// `std_dev` scaled by the sensitivity multiplier
    pub threshold: f64,
    pub sensitivity: Sensitivity,
    pub sample_count: usize,
    pub confidence: f64,
    pub built_at: DateTime<Utc>,
}

impl BaselinePattern {
    /// Build from history. Returns `None` below `min_points` samples.
    pub fn build(
        device_id: &str,
        history: &[Reading],
        sensitivity: Sensitivity,
        min_points: usize,
        offset: FixedOffset,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let powers: Vec<f64> = history
            .iter()
            .map(|r| r.power_w)
            .filter(|p| p.is_finite())
            .collect();
        if powers.is_empty() || powers.len() < min_points {
            return None;
        }

        let global_mean = mean(&powers);
        let std_dev = std_dev(&powers, global_mean);
        let (sums, counts) = hourly_sums(history, offset);

        let mut hourly_mean = [global_mean; HOURS];
        for hour in 0..HOURS {
            if counts[hour] > 0 {
                hourly_mean[hour] = sums[hour] / counts[hour] as f64;
            }
        }

        Some(Self {
            device_id: device_id.to_string(),
            hourly_mean,
            hourly_samples: counts,
            global_mean,
            std_dev,
            threshold: std_dev * sensitivity.multiplier(),
            sensitivity,
            sample_count: powers.len(),
            confidence: baseline_confidence(powers.len(), min_points),
            built_at: now,
        })
    }

    pub fn expected_at(&self, hour: u32) -> f64 {
        self.hourly_mean[hour as usize % HOURS]
    }

    /// Slots backed by at least one sample.
    pub fn covered_hours(&self) -> usize {
        self.hourly_samples.iter().filter(|&&n| n > 0).count()
    }
}

/// `min(1, samples / (2 * min_points))`.
pub fn baseline_confidence(samples: usize, min_points: usize) -> f64 {
    let denominator = (2 * min_points.max(1)) as f64;
    (samples as f64 / denominator).min(1.0)
}

/// Local hour of a reading.
pub fn local_hour(timestamp: DateTime<Utc>, offset: FixedOffset) -> u32 {
    timestamp.with_timezone(&offset).hour()
}

/// Per-hour power sums and sample counts.
pub fn hourly_sums(history: &[Reading], offset: FixedOffset) -> ([f64; HOURS], [usize; HOURS]) {
    let mut sums = [0.0; HOURS];
    let mut counts = [0usize; HOURS];
    for reading in history.iter().filter(|r| r.power_w.is_finite()) {
        let hour = local_hour(reading.timestamp, offset) as usize;
        sums[hour] += reading.power_w;
        counts[hour] += 1;
    }
    (sums, counts)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Least-squares slope of `values` against their index.
pub fn regression_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = mean(values);
    let (mut num, mut den) = (0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn day_of_readings(start: DateTime<Utc>, hours: &[(u32, f64)], per_hour: usize) -> Vec<Reading> {
        let mut out = Vec::new();
        for &(hour, power) in hours {
            for i in 0..per_hour {
                let ts = start + Duration::hours(hour as i64) + Duration::minutes(i as i64);
                out.push(Reading::new("m", ts, power));
            }
        }
        out
    }

    #[test]
    fn test_hourly_means_and_fallback() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let history = day_of_readings(start, &[(8, 100.0), (19, 300.0)], 30);
        let baseline =
            BaselinePattern::build("m", &history, Sensitivity::Medium, 50, utc(), start).unwrap();

        assert_eq!(baseline.expected_at(8), 100.0);
        assert_eq!(baseline.expected_at(19), 300.0);
        // Empty slot falls back to the global mean
        assert_eq!(baseline.expected_at(3), 200.0);
        assert_eq!(baseline.std_dev, 100.0);
        assert_eq!(baseline.threshold, 200.0);
        assert_eq!(baseline.covered_hours(), 2);
        assert!((baseline.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_too_few_points() {
        let start = Utc::now();
        let history = day_of_readings(start, &[(1, 10.0)], 49);
        assert!(BaselinePattern::build("m", &history, Sensitivity::Low, 50, utc(), start).is_none());
    }

    #[test]
    fn test_confidence_monotonic_up_to_one() {
        let mut last = 0.0;
        for n in 0..300 {
            let c = baseline_confidence(n, 50);
            assert!(c >= last);
            assert!(c <= 1.0);
            last = c;
        }
        assert_eq!(baseline_confidence(100, 50), 1.0);
    }

    #[test]
    fn test_local_hour_uses_offset() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 17, 0, 0).unwrap();
        assert_eq!(local_hour(ts, FixedOffset::east_opt(2 * 3600).unwrap()), 19);
    }

    #[test]
    fn test_regression_slope() {
        let values: Vec<f64> = (0..10).map(|i| 5.0 - 0.5 * i as f64).collect();
        assert!((regression_slope(&values) + 0.5).abs() < 1e-12);
        assert_eq!(regression_slope(&[1.0]), 0.0);
    }
}
