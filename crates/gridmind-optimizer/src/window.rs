//! Local time-of-day windows.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

/// `[start, end)` in local time. `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Build from whole hours; out-of-range hours map to midnight.
    pub fn hours(start: u32, end: u32) -> Self {
        let at = |h: u32| NaiveTime::from_hms_opt(h, 0, 0).unwrap_or(NaiveTime::MIN);
        Self::new(at(start), at(end))
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// `"HH:MM"` (seconds optional) for [`NaiveTime`].
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(value: &str) -> Result<NaiveTime, chrono::ParseError> {
        NaiveTime::parse_from_str(value, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
    }

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(|e| serde::de::Error::custom(format!("invalid time {:?}: {}", raw, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_plain_and_wrapping_windows() {
        let evening = TimeWindow::hours(18, 22);
        assert!(evening.contains(t(19, 0)));
        assert!(evening.contains(t(18, 0)));
        assert!(!evening.contains(t(22, 0)));

        let night = TimeWindow::hours(23, 5);
        assert!(night.contains(t(23, 30)));
        assert!(night.contains(t(2, 0)));
        assert!(!night.contains(t(5, 0)));
        assert!(!night.contains(t(12, 0)));
    }

    #[test]
    fn test_serde_as_hhmm() {
        let window: TimeWindow = serde_json::from_str(r#"{"start":"18:00","end":"22:30"}"#).unwrap();
        assert_eq!(window.end, t(22, 30));
        assert_eq!(
            serde_json::to_string(&window).unwrap(),
            r#"{"start":"18:00","end":"22:30"}"#
        );
        assert!(serde_json::from_str::<TimeWindow>(r#"{"start":"25:00","end":"01:00"}"#).is_err());
    }
}
