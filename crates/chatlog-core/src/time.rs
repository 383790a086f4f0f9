//! Civil-time arithmetic for the archive API.
//!
//! The archive interprets every date in one fixed civil timezone, so day
//! boundaries are computed there and never in UTC.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_CIVIL_ZONE: &str = "Asia/Shanghai";

const DATE_FORMAT: &str = "%Y-%m-%d";
const RANGE_SEPARATOR: char = '~';
const MILLIS_PER_DAY: f64 = 86_400_000.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("unknown timezone `{0}`")]
    UnknownZone(String),
    #[error("invalid date range `{0}`")]
    InvalidRange(String),
}

/// The archive's civil timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CivilZone(Tz);

impl CivilZone {
    pub fn new(tz: Tz) -> Self {
        Self(tz)
    }

    pub fn parse(name: &str) -> Result<Self, TimeError> {
        name.parse::<Tz>()
            .map(Self)
            .map_err(|_| TimeError::UnknownZone(name.to_string()))
    }

    pub fn tz(&self) -> Tz {
        self.0
    }

    pub fn date_of(&self, timestamp: DateTime<Utc>) -> NaiveDate {
        timestamp.with_timezone(&self.0).date_naive()
    }

    /// ISO-8601 with the civil offset, e.g. `2024-01-10T08:00:00+08:00`.
    pub fn format_timestamp(&self, timestamp: DateTime<Utc>) -> String {
        timestamp
            .with_timezone(&self.0)
            .format("%Y-%m-%dT%H:%M:%S%:z")
            .to_string()
    }

    /// Accepts RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS[.f]` / `YYYY-MM-DD HH:MM:SS`
    /// read as civil time.
    pub fn parse_timestamp(&self, raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }

        let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
            .ok()?;

        Some(self.from_civil(naive))
    }

    pub fn from_civil(&self, naive: NaiveDateTime) -> DateTime<Utc> {
        match self.0.from_local_datetime(&naive) {
            LocalResult::Single(datetime) => datetime.with_timezone(&Utc),
            LocalResult::Ambiguous(first, _) => first.with_timezone(&Utc),
            LocalResult::None => Utc.from_utc_datetime(&naive),
        }
    }

    /// Start of the civil day containing `timestamp`.
    pub fn start_of_day(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let date = self.date_of(timestamp);
        self.from_civil(date.and_time(NaiveTime::MIN))
    }
}

impl Default for CivilZone {
    fn default() -> Self {
        Self(chrono_tz::Asia::Shanghai)
    }
}

/// Inclusive range of civil dates, rendered as `YYYY-MM-DD` or
/// `YYYY-MM-DD~YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CivilDateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl CivilDateRange {
    pub fn new(a: NaiveDate, b: NaiveDate) -> Self {
        if a <= b {
            Self { start: a, end: b }
        } else {
            Self { start: b, end: a }
        }
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// Civil dates touched by `[from, to]`.
    pub fn covering(zone: &CivilZone, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self::new(zone.date_of(from), zone.date_of(to))
    }

    /// The last `days` days up to and including the civil date of `now`.
    pub fn recent_days(zone: &CivilZone, now: DateTime<Utc>, days: i64) -> Self {
        let end = zone.date_of(now);
        Self::new(end - Duration::days(days.max(0)), end)
    }

    pub fn day_count(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl fmt::Display for CivilDateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start.format(DATE_FORMAT))
        } else {
            write!(
                f,
                "{}{RANGE_SEPARATOR}{}",
                self.start.format(DATE_FORMAT),
                self.end.format(DATE_FORMAT)
            )
        }
    }
}

impl FromStr for CivilDateRange {
    type Err = TimeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || TimeError::InvalidRange(raw.to_string());
        let parse = |part: &str| NaiveDate::parse_from_str(part.trim(), DATE_FORMAT);

        match raw.split_once(RANGE_SEPARATOR) {
            Some((start, end)) => {
                let start = parse(start).map_err(|_| invalid())?;
                let end = parse(end).map_err(|_| invalid())?;
                if start > end {
                    return Err(invalid());
                }
                Ok(Self { start, end })
            }
            None => parse(raw).map(Self::single).map_err(|_| invalid()),
        }
    }
}

/// Inclusive instant window `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(a: DateTime<Utc>, b: DateTime<Utc>) -> Self {
        if a <= b {
            Self { start: a, end: b }
        } else {
            Self { start: b, end: a }
        }
    }

    /// Window of `days` (fractional) ending at `end`.
    pub fn ending_at(end: DateTime<Utc>, days: f64) -> Self {
        Self::new(end - days_to_duration(days), end)
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn days(&self) -> f64 {
        self.duration().num_milliseconds() as f64 / MILLIS_PER_DAY
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }

    pub fn covers(&self, other: &TimeWindow) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn union(&self, other: &TimeWindow) -> TimeWindow {
        TimeWindow {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn to_date_range(&self, zone: &CivilZone) -> CivilDateRange {
        CivilDateRange::covering(zone, self.start, self.end)
    }
}

pub fn days_to_duration(days: f64) -> Duration {
    Duration::milliseconds((days.max(0.0) * MILLIS_PER_DAY).round() as i64)
}

/// Whole days from `from` to `to`, rounded up. Negative spans yield zero.
pub fn days_between_ceil(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    let millis = (to - from).num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    (millis as f64 / MILLIS_PER_DAY).ceil() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn formats_single_and_ranged_dates() {
        assert_eq!(CivilDateRange::single(date(2024, 1, 5)).to_string(), "2024-01-05");
        assert_eq!(
            CivilDateRange::new(date(2024, 1, 9), date(2023, 12, 30)).to_string(),
            "2023-12-30~2024-01-09"
        );
    }

    #[test]
    fn parses_ranges_and_rejects_reversed() {
        let range: CivilDateRange = "2023-12-01~2024-01-01".parse().expect("range parsed");
        assert_eq!(range.day_count(), 32);
        assert!(range.contains(date(2023, 12, 25)));
        assert!("2024-01-02~2024-01-01".parse::<CivilDateRange>().is_err());
        assert!("yesterday".parse::<CivilDateRange>().is_err());
    }

    #[test]
    fn civil_day_boundary_is_not_utc() {
        let zone = CivilZone::default();
        // 2024-01-09T20:00Z is already 2024-01-10 04:00 in UTC+8.
        let ts = Utc.with_ymd_and_hms(2024, 1, 9, 20, 0, 0).unwrap();
        assert_eq!(zone.date_of(ts), date(2024, 1, 10));
        assert_eq!(
            zone.start_of_day(ts),
            Utc.with_ymd_and_hms(2024, 1, 9, 16, 0, 0).unwrap()
        );
    }

    #[test]
    fn naive_timestamps_read_as_civil_time() {
        let zone = CivilZone::default();
        let parsed = zone.parse_timestamp("2024-01-10T08:00:00").expect("naive parsed");
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap());
        let explicit = zone
            .parse_timestamp("2024-01-10T08:00:00+00:00")
            .expect("rfc3339 parsed");
        assert_eq!(explicit, Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap());
        assert_eq!(zone.format_timestamp(parsed), "2024-01-10T08:00:00+08:00");
    }

    #[test]
    fn window_arithmetic() {
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let window = TimeWindow::ending_at(end, 0.5);
        assert_eq!(window.duration(), Duration::hours(12));
        assert!((window.days() - 0.5).abs() < f64::EPSILON);
        let wider = TimeWindow::ending_at(end, 2.0);
        assert!(wider.covers(&window));
        assert!(wider.overlaps(&window));
        assert_eq!(window.union(&wider), wider);
    }

    #[test]
    fn ceil_day_delta() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(days_between_ceil(from, from), 0);
        assert_eq!(days_between_ceil(from, from + Duration::minutes(5)), 1);
        assert_eq!(days_between_ceil(from, from + Duration::days(7)), 7);
        assert_eq!(days_between_ceil(from, from + Duration::days(7) + Duration::seconds(1)), 8);
        assert_eq!(days_between_ceil(from + Duration::days(1), from), 0);
    }
}
