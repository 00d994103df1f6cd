//! Window function resolver.
//!
//! Maps a timestamp to the start of the window containing it. Fixed windows are
//! aligned to the Unix epoch in UTC, weeks start on Monday, and months may be
//! anchored to a billing day instead of the calendar month boundary.

use crate::error::UsageError;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported granularities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowSize {
    #[serde(rename = "MINUTE")]
    Minute,
    #[serde(rename = "15MIN")]
    FifteenMin,
    #[serde(rename = "30MIN")]
    ThirtyMin,
    #[serde(rename = "HOUR")]
    Hour,
    #[serde(rename = "3HOUR")]
    ThreeHour,
    #[serde(rename = "6HOUR")]
    SixHour,
    #[serde(rename = "12HOUR")]
    TwelveHour,
    #[serde(rename = "DAY")]
    Day,
    #[serde(rename = "WEEK")]
    Week,
    #[serde(rename = "MONTH")]
    Month,
}

impl WindowSize {
    pub const ALL: [WindowSize; 10] = [
        WindowSize::Minute,
        WindowSize::FifteenMin,
        WindowSize::ThirtyMin,
        WindowSize::Hour,
        WindowSize::ThreeHour,
        WindowSize::SixHour,
        WindowSize::TwelveHour,
        WindowSize::Day,
        WindowSize::Week,
        WindowSize::Month,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowSize::Minute => "MINUTE",
            WindowSize::FifteenMin => "15MIN",
            WindowSize::ThirtyMin => "30MIN",
            WindowSize::Hour => "HOUR",
            WindowSize::ThreeHour => "3HOUR",
            WindowSize::SixHour => "6HOUR",
            WindowSize::TwelveHour => "12HOUR",
            WindowSize::Day => "DAY",
            WindowSize::Week => "WEEK",
            WindowSize::Month => "MONTH",
        }
    }

    /// Permissive parse for optional granularities coming from configuration:
    /// anything unrecognised resolves to hourly.
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(WindowSize::Hour)
    }

    /// Length of an epoch-aligned fixed window in seconds. Weeks and months are
    /// calendar aligned and have no fixed step.
    pub fn fixed_step_secs(&self) -> Option<i64> {
        match self {
            WindowSize::Minute => Some(60),
            WindowSize::FifteenMin => Some(15 * 60),
            WindowSize::ThirtyMin => Some(30 * 60),
            WindowSize::Hour => Some(3_600),
            WindowSize::ThreeHour => Some(3 * 3_600),
            WindowSize::SixHour => Some(6 * 3_600),
            WindowSize::TwelveHour => Some(12 * 3_600),
            WindowSize::Day => Some(86_400),
            WindowSize::Week | WindowSize::Month => None,
        }
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WindowSize {
    type Err = UsageError;

    /// Strict parse: an explicitly supplied but unsupported granularity is a
    /// validation error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MINUTE" => Ok(WindowSize::Minute),
            "15MIN" => Ok(WindowSize::FifteenMin),
            "30MIN" => Ok(WindowSize::ThirtyMin),
            "HOUR" => Ok(WindowSize::Hour),
            "3HOUR" => Ok(WindowSize::ThreeHour),
            "6HOUR" => Ok(WindowSize::SixHour),
            "12HOUR" => Ok(WindowSize::TwelveHour),
            "DAY" => Ok(WindowSize::Day),
            "WEEK" => Ok(WindowSize::Week),
            "MONTH" => Ok(WindowSize::Month),
            other => Err(UsageError::validation(format!(
                "unsupported window size '{}'",
                other
            ))),
        }
    }
}

/// Resolved bucket-start computation for one granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowFn {
    size: WindowSize,
    /// `anchor_day - 1`; only meaningful for monthly windows.
    anchor_offset_days: u32,
}

impl WindowFn {
    /// Resolve a granularity. Unset granularity is hourly; the anchor only
    /// affects monthly windows and only its day-of-month is used.
    pub fn resolve(size: Option<WindowSize>, anchor: Option<DateTime<Utc>>) -> Self {
        let size = size.unwrap_or(WindowSize::Hour);
        let anchor_offset_days = match (size, anchor) {
            (WindowSize::Month, Some(anchor)) => anchor.day() - 1,
            _ => 0,
        };
        Self {
            size,
            anchor_offset_days,
        }
    }

    pub fn size(&self) -> WindowSize {
        self.size
    }

    pub fn anchor_offset_days(&self) -> u32 {
        self.anchor_offset_days
    }

    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(step) = self.size.fixed_step_secs() {
            let secs = ts.timestamp().div_euclid(step) * step;
            return DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or(ts);
        }
        match self.size {
            WindowSize::Week => {
                let date = ts.date_naive();
                let monday =
                    date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
                midnight(monday)
            }
            _ => {
                let offset = Duration::days(i64::from(self.anchor_offset_days));
                let shifted = ts - offset;
                month_start(shifted.year(), shifted.month()) + offset
            }
        }
    }

    /// Exclusive end of the window containing `ts`.
    pub fn bucket_end(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.bucket_start(ts);
        if let Some(step) = self.size.fixed_step_secs() {
            return start + Duration::seconds(step);
        }
        match self.size {
            WindowSize::Week => start + Duration::days(7),
            _ => {
                let offset = Duration::days(i64::from(self.anchor_offset_days));
                let shifted = start - offset;
                let (year, month) = if shifted.month() == 12 {
                    (shifted.year() + 1, 1)
                } else {
                    (shifted.year(), shifted.month() + 1)
                };
                month_start(year, month) + offset
            }
        }
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::default()))
}

fn month_start(year: i32, month: u32) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .map(midnight)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Sub-window a metric is first aggregated in. Owned by the meter definition,
/// never by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricBucket(WindowSize);

impl MetricBucket {
    pub fn new(size: WindowSize) -> Self {
        Self(size)
    }

    pub fn size(&self) -> WindowSize {
        self.0
    }

    /// Metric buckets are calendar aligned and ignore billing anchors.
    pub fn window_fn(&self) -> WindowFn {
        WindowFn::resolve(Some(self.0), None)
    }
}

/// Caller-requested granularity for time-series points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportingWindow {
    size: WindowSize,
    billing_anchor: Option<DateTime<Utc>>,
}

impl ReportingWindow {
    pub fn new(size: WindowSize, billing_anchor: Option<DateTime<Utc>>) -> Self {
        Self {
            size,
            billing_anchor,
        }
    }

    /// Report at the metric's own bucket granularity. Used when the caller did
    /// not request a window size for a bucketed feature.
    pub fn from_metric_bucket(bucket: MetricBucket) -> Self {
        Self::new(bucket.size(), None)
    }

    pub fn size(&self) -> WindowSize {
        self.size
    }

    pub fn billing_anchor(&self) -> Option<DateTime<Utc>> {
        self.billing_anchor
    }

    pub fn window_fn(&self) -> WindowFn {
        WindowFn::resolve(Some(self.size), self.billing_anchor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn fixed_windows_truncate_to_epoch_boundaries() {
        let ts = at(2024, 5, 17, 14, 47, 33);
        let cases = [
            (WindowSize::Minute, at(2024, 5, 17, 14, 47, 0)),
            (WindowSize::FifteenMin, at(2024, 5, 17, 14, 45, 0)),
            (WindowSize::ThirtyMin, at(2024, 5, 17, 14, 30, 0)),
            (WindowSize::Hour, at(2024, 5, 17, 14, 0, 0)),
            (WindowSize::ThreeHour, at(2024, 5, 17, 12, 0, 0)),
            (WindowSize::SixHour, at(2024, 5, 17, 12, 0, 0)),
            (WindowSize::TwelveHour, at(2024, 5, 17, 12, 0, 0)),
            (WindowSize::Day, at(2024, 5, 17, 0, 0, 0)),
        ];
        for (size, expected) in cases {
            assert_eq!(
                WindowFn::resolve(Some(size), None).bucket_start(ts),
                expected,
                "{}",
                size
            );
        }
    }

    #[test]
    fn weeks_start_on_monday() {
        // 2024-05-17 is a Friday.
        let window = WindowFn::resolve(Some(WindowSize::Week), None);
        assert_eq!(
            window.bucket_start(at(2024, 5, 17, 9, 0, 0)),
            at(2024, 5, 13, 0, 0, 0)
        );
        assert_eq!(
            window.bucket_start(at(2024, 5, 13, 0, 0, 0)),
            at(2024, 5, 13, 0, 0, 0)
        );
    }

    #[test]
    fn anchored_month_starts_on_billing_day() {
        let anchor = at(2023, 11, 5, 17, 30, 0);
        let window = WindowFn::resolve(Some(WindowSize::Month), Some(anchor));
        assert_eq!(
            window.bucket_start(at(2024, 3, 20, 8, 0, 0)),
            at(2024, 3, 5, 0, 0, 0)
        );
        assert_eq!(
            window.bucket_start(at(2024, 3, 4, 23, 59, 59)),
            at(2024, 2, 5, 0, 0, 0)
        );
        assert_eq!(
            window.bucket_end(at(2024, 3, 4, 23, 59, 59)),
            at(2024, 3, 5, 0, 0, 0)
        );
    }

    #[test]
    fn anchored_month_wraps_year() {
        let window = WindowFn::resolve(Some(WindowSize::Month), Some(at(2024, 1, 15, 0, 0, 0)));
        assert_eq!(
            window.bucket_start(at(2025, 1, 10, 0, 0, 0)),
            at(2024, 12, 15, 0, 0, 0)
        );
        assert_eq!(
            window.bucket_end(at(2025, 1, 10, 0, 0, 0)),
            at(2025, 1, 15, 0, 0, 0)
        );
    }

    #[test]
    fn unset_granularity_is_hourly() {
        let window = WindowFn::resolve(None, None);
        assert_eq!(window.size(), WindowSize::Hour);
        assert_eq!(WindowSize::parse_lenient("fortnight"), WindowSize::Hour);
    }

    #[test]
    fn strict_parse_rejects_unknown_granularity() {
        assert_eq!("15min".parse::<WindowSize>().unwrap(), WindowSize::FifteenMin);
        assert!("fortnight".parse::<WindowSize>().unwrap_err().is_validation());
    }

    #[test]
    fn anchor_is_ignored_for_non_monthly_windows() {
        let window = WindowFn::resolve(Some(WindowSize::Day), Some(at(2024, 1, 20, 0, 0, 0)));
        assert_eq!(window.anchor_offset_days(), 0);
    }

    #[test]
    fn metric_bucket_converts_only_by_name() {
        let bucket = MetricBucket::new(WindowSize::Hour);
        let window = ReportingWindow::from_metric_bucket(bucket);
        assert_eq!(window.size(), WindowSize::Hour);
        assert_eq!(window.billing_anchor(), None);
    }
}
