//! Wall-clock abstraction.
//!
//! Time-of-day logic (hourly baselines, night windows, tariffs) runs against
//! a [`Clock`] so tests can pin the hour without touching the system time.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, Timelike, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Site-local offset used for time-of-day decisions.
    fn offset(&self) -> FixedOffset;

    fn local_now(&self) -> DateTime<FixedOffset> {
        self.now().with_timezone(&self.offset())
    }

    fn local_time(&self) -> NaiveTime {
        self.local_now().time()
    }

    fn local_hour(&self) -> u32 {
        self.local_now().hour()
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Build a fixed offset from minutes east of UTC, falling back to UTC.
pub fn offset_from_minutes(minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(minutes * 60).unwrap_or_else(utc_offset)
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}

/// System time with a configured local offset.
#[derive(Debug, Clone)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn new(offset_minutes: i32) -> Self {
        Self {
            offset: offset_from_minutes(offset_minutes),
        }
    }

    pub fn utc() -> Self {
        Self::new(0)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::utc()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

/// Manually advanced clock for tests and replays.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
    offset: FixedOffset,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
            offset: utc_offset(),
        }
    }

    pub fn with_offset(mut self, minutes: i32) -> Self {
        self.offset = offset_from_minutes(minutes);
        self
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_local_hour() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 17, 30, 0).unwrap();
        let clock = ManualClock::new(start).with_offset(120);
        assert_eq!(clock.local_hour(), 19);

        clock.advance(Duration::hours(5));
        assert_eq!(clock.local_hour(), 0);
        assert_eq!(clock.now(), start + Duration::hours(5));
    }

    #[test]
    fn test_invalid_offset_falls_back_to_utc() {
        assert_eq!(offset_from_minutes(100_000).local_minus_utc(), 0);
        assert_eq!(offset_from_minutes(-300).local_minus_utc(), -18_000);
    }
}
