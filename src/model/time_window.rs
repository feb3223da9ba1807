use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// A time-aligned bucket. `contains(t)` iff `start <= t < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub duration_seconds: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }

    /// The 5-minute window enclosing `t`. `floor5(t)` zeroes seconds/microseconds
    /// and rounds minutes down to a multiple of 5.
    pub fn five_minute(t: DateTime<Utc>) -> Self {
        Self::for_duration(t, 300)
    }

    pub fn hourly(t: DateTime<Utc>) -> Self {
        Self::for_duration(t, 3600)
    }

    pub fn daily(t: DateTime<Utc>) -> Self {
        Self::for_duration(t, 86_400)
    }

    /// Weekly window anchored to Monday 00:00 UTC.
    pub fn weekly(t: DateTime<Utc>) -> Self {
        let days_since_monday = t.weekday().num_days_from_monday() as i64;
        let start = (t - Duration::days(days_since_monday))
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always a valid time")
            .and_utc();
        Self {
            duration_seconds: 604_800,
            start,
            end: start + Duration::seconds(604_800),
        }
    }

    /// Rounds `t` down to the start of a window of the given duration. Canonical
    /// durations (300/3600/86400/604800) use calendar-aligned rounding; any other
    /// duration rounds down to the nearest multiple from the Unix epoch.
    pub fn for_duration(t: DateTime<Utc>, duration_seconds: i64) -> Self {
        let start = match duration_seconds {
            300 => t
                .with_minute((t.minute() / 5) * 5)
                .and_then(|d| d.with_second(0))
                .and_then(|d| d.with_nanosecond(0))
                .expect("5-minute floor is always representable"),
            3600 => t
                .with_minute(0)
                .and_then(|d| d.with_second(0))
                .and_then(|d| d.with_nanosecond(0))
                .expect("hour floor is always representable"),
            86_400 => t
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .expect("midnight is always a valid time")
                .and_utc(),
            604_800 => return Self::weekly(t),
            other => {
                let epoch = t.timestamp();
                let rounded = (epoch.div_euclid(other)) * other;
                Utc.timestamp_opt(rounded, 0)
                    .single()
                    .expect("rounded epoch seconds are always representable")
            }
        };
        Self {
            duration_seconds,
            start,
            end: start + Duration::seconds(duration_seconds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_minute_floor_is_aligned() {
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 12, 37, 42).unwrap();
        let w = TimeWindow::five_minute(t);
        assert_eq!(w.start.minute() % 5, 0);
        assert_eq!(w.start.second(), 0);
        assert!(w.contains(t));
        assert_eq!(w.end - w.start, Duration::minutes(5));
    }

    #[test]
    fn weekly_anchors_to_monday() {
        let t = Utc.with_ymd_and_hms(2025, 1, 3, 15, 0, 0).unwrap(); // a Friday
        let w = TimeWindow::weekly(t);
        assert_eq!(w.start.weekday(), chrono::Weekday::Mon);
        assert_eq!(w.start.hour(), 0);
    }
}
