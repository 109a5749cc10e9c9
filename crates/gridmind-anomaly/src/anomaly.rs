//! Anomaly records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of deviation from a device's baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    Spike,
    Drop,
    PatternDeviation,
    EfficiencyLoss,
    UnusualTiming,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spike => "spike",
            Self::Drop => "drop",
            Self::PatternDeviation => "pattern_deviation",
            Self::EfficiencyLoss => "efficiency_loss",
            Self::UnusualTiming => "unusual_timing",
        }
    }

    /// Suggested operator actions.
    pub fn recommendations(&self) -> Vec<String> {
        let items: &[&str] = match self {
            Self::Spike => &[
                "Check the device for a fault or stuck load",
                "Verify no additional load was connected to the circuit",
                "Consider a power limit during peak hours",
            ],
            Self::Drop => &[
                "Check whether the device tripped or lost supply",
                "Inspect wiring and the metering connection",
            ],
            Self::PatternDeviation => &[
                "Review recent schedule or occupancy changes",
                "Rebuild the baseline if the new pattern is expected",
            ],
            Self::EfficiencyLoss => &[
                "Schedule maintenance: a falling power factor often means motor or capacitor wear",
                "Clean filters and heat exchangers on HVAC equipment",
            ],
            Self::UnusualTiming => &[
                "Check for equipment left running overnight",
                "Add a night standby rule for this device",
            ],
        };
        items.iter().map(|s| s.to_string()).collect()
    }
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detection sensitivity. Higher sensitivity means a tighter threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    #[default]
    Medium,
    High,
}

impl Sensitivity {
    /// Standard deviations per threshold unit.
    pub fn multiplier(&self) -> f64 {
        match self {
            Self::Low => 2.5,
            Self::Medium => 2.0,
            Self::High => 1.5,
        }
    }
}

/// Output of one detection check, before book-keeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub observed: f64,
    pub expected: f64,
    pub deviation_pct: f64,
    pub confidence: f64,
    pub description: String,
}

/// A detected anomaly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: String,
    pub device_id: String,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    /// Value that triggered detection
    pub observed: f64,
    /// Baseline value at the time
    pub expected: f64,
    pub deviation_pct: f64,
    /// Always within `0.0..=1.0`
    pub confidence: f64,
    pub description: String,
    pub recommendations: Vec<String>,
    pub detected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Detections merged into this record
    pub occurrences: u32,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Anomaly {
    pub fn from_finding(device_id: impl Into<String>, finding: Finding, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            anomaly_type: finding.anomaly_type,
            severity: finding.severity,
            observed: finding.observed,
            expected: finding.expected,
            deviation_pct: finding.deviation_pct,
            confidence: clamp_confidence(finding.confidence),
            description: finding.description,
            recommendations: finding.anomaly_type.recommendations(),
            detected_at: now,
            updated_at: now,
            occurrences: 1,
            resolved: false,
            resolved_at: None,
        }
    }

    /// Fold a repeated detection into this record.
    ///
    /// Confidence and severity only ever go up; the observation is replaced
    /// by the latest one.
    pub fn merge(&mut self, finding: Finding, now: DateTime<Utc>) {
        self.confidence = self.confidence.max(clamp_confidence(finding.confidence));
        self.severity = self.severity.max(finding.severity);
        self.observed = finding.observed;
        self.expected = finding.expected;
        self.deviation_pct = finding.deviation_pct;
        self.description = finding.description;
        self.occurrences = self.occurrences.saturating_add(1);
        self.updated_at = now;
    }

    pub fn resolve(&mut self, now: DateTime<Utc>) {
        self.resolved = true;
        self.resolved_at = Some(now);
    }

    pub fn is_open(&self) -> bool {
        !self.resolved
    }
}

pub(crate) fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn finding(confidence: f64, severity: Severity) -> Finding {
        Finding {
            anomaly_type: AnomalyType::Spike,
            severity,
            observed: 300.0,
            expected: 100.0,
            deviation_pct: 200.0,
            confidence,
            description: "spike".into(),
        }
    }

    #[test]
    fn test_merge_keeps_maximum() {
        let t0 = Utc::now();
        let mut anomaly = Anomaly::from_finding("m", finding(0.9, Severity::High), t0);
        anomaly.merge(finding(0.6, Severity::Medium), t0 + Duration::minutes(2));

        assert_eq!(anomaly.confidence, 0.9);
        assert_eq!(anomaly.severity, Severity::High);
        assert_eq!(anomaly.occurrences, 2);
        assert_eq!(anomaly.detected_at, t0);
        assert!(!anomaly.recommendations.is_empty());
    }

    #[test]
    fn test_confidence_clamped() {
        let anomaly = Anomaly::from_finding("m", finding(7.0, Severity::Low), Utc::now());
        assert_eq!(anomaly.confidence, 1.0);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
        assert_eq!(clamp_confidence(-0.2), 0.0);
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!(Sensitivity::High.multiplier(), 1.5);
    }
}
