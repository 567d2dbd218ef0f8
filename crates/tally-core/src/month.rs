//! Calendar month arithmetic and date parsing.

use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// YearMonth
// ---------------------------------------------------------------------------

/// A calendar month. Orders chronologically (year first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    /// Returns `None` when `month` is outside 1..=12 or the year is out of
    /// chrono's range.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|_| Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(&self) -> NaiveDate {
        self.next()
            .first_day()
            .pred_opt()
            .unwrap_or(NaiveDate::MAX)
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Last instant of the month (`23:59:59.999` UTC on its last day),
    /// the reporting date attached to every data point.
    pub fn end_of_month(&self) -> DateTime<Utc> {
        self.last_day()
            .and_hms_milli_opt(23, 59, 59, 999)
            .unwrap_or_default()
            .and_utc()
    }

    /// The whole month as an inclusive date range.
    pub fn as_range(&self) -> DateRange {
        DateRange::new(self.first_day(), self.last_day())
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

// ---------------------------------------------------------------------------
// DateRange
// ---------------------------------------------------------------------------

/// Inclusive calendar range `[from, to]`. A range with `from > to` is
/// empty and covers no months.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    pub fn is_empty(&self) -> bool {
        self.from > self.to
    }

    /// First day after the range; SQL and pipeline predicates use it as an
    /// exclusive upper bound so timestamps late on `to` still match.
    pub fn end_exclusive(&self) -> NaiveDate {
        self.to.succ_opt().unwrap_or(NaiveDate::MAX)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        !self.is_empty() && date >= self.from && date <= self.to
    }

    /// Calendar months touched by the range, ascending.
    pub fn months(&self) -> Vec<YearMonth> {
        if self.is_empty() {
            return Vec::new();
        }
        let last = YearMonth::of(self.to);
        let mut current = YearMonth::of(self.from);
        let mut months = Vec::new();
        while current <= last {
            months.push(current);
            current = current.next();
        }
        months
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.from, self.to)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

/// Parse a textual timestamp as produced by the adapters (ISO-8601 with or
/// without time and offset). Offsets are converted to UTC.
pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(text, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// Calendar day as written, for sync markers. An offset stays attached to
/// the day it was recorded in instead of being shifted to UTC.
pub fn parse_local_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.date_naive());
    }
    parse_datetime(text).map(|dt| dt.date())
}

/// Calendar day of a cell, if it holds something date-like.
pub fn cell_date(cell: &Value) -> Option<NaiveDate> {
    match cell {
        Value::String(s) => parse_datetime(s).map(|dt| dt.date()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_rejects_invalid_month() {
        assert!(YearMonth::new(2024, 0).is_none());
        assert!(YearMonth::new(2024, 13).is_none());
        assert!(YearMonth::new(2024, 12).is_some());
    }

    #[test]
    fn test_last_day_handles_leap_years() {
        assert_eq!(YearMonth::new(2024, 2).unwrap().last_day(), d(2024, 2, 29));
        assert_eq!(YearMonth::new(2023, 2).unwrap().last_day(), d(2023, 2, 28));
        assert_eq!(YearMonth::new(2023, 12).unwrap().last_day(), d(2023, 12, 31));
    }

    #[test]
    fn test_end_of_month_is_last_instant() {
        let eom = YearMonth::new(2024, 1).unwrap().end_of_month();
        assert_eq!(eom.to_rfc3339(), "2024-01-31T23:59:59.999+00:00");
    }

    #[test]
    fn test_next_wraps_year() {
        let dec = YearMonth::new(2023, 12).unwrap();
        assert_eq!(dec.next(), YearMonth::new(2024, 1).unwrap());
    }

    #[test]
    fn test_range_months_spans_year_boundary() {
        let range = DateRange::new(d(2023, 11, 15), d(2024, 2, 3));
        let months: Vec<String> = range.months().iter().map(|m| m.to_string()).collect();
        assert_eq!(months, vec!["2023-11", "2023-12", "2024-01", "2024-02"]);
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let range = DateRange::new(d(2024, 5, 1), d(2024, 4, 30));
        assert!(range.is_empty());
        assert!(range.months().is_empty());
        assert!(!range.contains(d(2024, 5, 1)));
    }

    #[test]
    fn test_range_is_inclusive() {
        let range = DateRange::new(d(2024, 1, 1), d(2024, 1, 31));
        assert!(range.contains(d(2024, 1, 1)));
        assert!(range.contains(d(2024, 1, 31)));
        assert!(!range.contains(d(2024, 2, 1)));
        assert_eq!(range.end_exclusive(), d(2024, 2, 1));
    }

    #[test]
    fn test_parse_datetime_formats() {
        assert_eq!(parse_datetime("2024-01-15").unwrap().date(), d(2024, 1, 15));
        assert_eq!(
            parse_datetime("2024-01-15 08:30:00").unwrap().date(),
            d(2024, 1, 15)
        );
        assert_eq!(
            parse_datetime("2024-01-15T08:30:00.250").unwrap().date(),
            d(2024, 1, 15)
        );
        assert_eq!(
            parse_datetime("2024-01-31T23:30:00-05:00").unwrap().date(),
            d(2024, 2, 1)
        );
        assert_eq!(parse_datetime("2024/03/02").unwrap().date(), d(2024, 3, 2));
        assert!(parse_datetime("yesterday").is_none());
        assert!(parse_datetime("  ").is_none());
    }

    #[test]
    fn test_local_date_keeps_written_day() {
        assert_eq!(
            parse_local_date("2023-03-31T23:59:59.999-03:00"),
            Some(d(2023, 3, 31))
        );
        assert_eq!(
            parse_local_date("2023-04-01T01:00:00+05:00"),
            Some(d(2023, 4, 1))
        );
        assert_eq!(parse_local_date("2023-03-31"), Some(d(2023, 3, 31)));
        assert_eq!(parse_local_date("soon"), None);
    }

    #[test]
    fn test_cell_date_ignores_non_strings() {
        assert_eq!(cell_date(&Value::from("2024-02-01")), Some(d(2024, 2, 1)));
        assert_eq!(cell_date(&Value::from(20240201)), None);
        assert_eq!(cell_date(&Value::Null), None);
    }
}
