use std::sync::LazyLock;

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

static RE_GERMAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})\.(\d{1,2})\.(\d{4})$").unwrap());
static RE_ISO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})$").unwrap());

/// Textual date convention used when writing dates to the target store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateStyle {
    /// `31.07.2025`
    #[default]
    German,
    /// `2025-07-31`
    Iso,
}

impl DateStyle {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "german" | "de" | "dd.mm.yyyy" => Ok(DateStyle::German),
            "iso" | "yyyy-mm-dd" => Ok(DateStyle::Iso),
            other => Err(Error::Config(format!("unknown date style: {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DateStyle::German => "german",
            DateStyle::Iso => "iso",
        }
    }
}

/// Normalize a date written as `DD.MM.YYYY` or `YYYY-MM-DD` into a calendar date.
///
/// Anything else, including impossible dates such as `31.04.2025`, fails
/// with [`Error::InvalidDateFormat`].
pub fn normalize_date(input: &str) -> Result<NaiveDate> {
    let s = input.trim();

    let (year, month, day) = if let Some(caps) = RE_GERMAN.captures(s) {
        (caps[3].parse::<i32>(), caps[2].parse::<u32>(), caps[1].parse::<u32>())
    } else if let Some(caps) = RE_ISO.captures(s) {
        (caps[1].parse::<i32>(), caps[2].parse::<u32>(), caps[3].parse::<u32>())
    } else {
        return Err(Error::InvalidDateFormat(input.to_string()));
    };

    match (year, month, day) {
        (Ok(y), Ok(m), Ok(d)) => NaiveDate::from_ymd_opt(y, m, d)
            .ok_or_else(|| Error::InvalidDateFormat(input.to_string())),
        _ => Err(Error::InvalidDateFormat(input.to_string())),
    }
}

/// Like [`normalize_date`], but tolerates a trailing time component as SQL
/// servers emit for date columns (`2025-07-31T00:00:00`, `31.07.2025 00:00:00`).
pub fn parse_stored_date(input: &str) -> Result<NaiveDate> {
    let s = input.trim();
    let date_part = s
        .split(|c| c == 'T' || c == ' ')
        .next()
        .unwrap_or(s);
    normalize_date(date_part).map_err(|_| Error::InvalidDateFormat(input.to_string()))
}

/// Parse a wall-clock time, truncated to minute precision.
///
/// Accepts `HH:MM`, `HH:MM:SS`, `HH:MM:SS.fffffff` and ISO timestamps
/// (`2025-07-31T08:30:00Z`).
pub fn parse_time(input: &str) -> Option<NaiveTime> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(dt) = parse_timestamp(s) {
        return truncate_to_minute(dt.time());
    }
    let t = NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()?;
    truncate_to_minute(t)
}

/// Parse an ISO timestamp as the feed sends it. The wall-clock reading in the
/// timestamp's own offset is kept; no timezone conversion happens.
pub fn parse_timestamp(input: &str) -> Option<NaiveDateTime> {
    let s = input.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_local());
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M"))
        .ok()
}

fn truncate_to_minute(t: NaiveTime) -> Option<NaiveTime> {
    NaiveTime::from_hms_opt(t.hour(), t.minute(), 0)
}

/// Render a date in the given store convention.
pub fn format_date(date: NaiveDate, style: DateStyle) -> String {
    match style {
        DateStyle::German => date.format("%d.%m.%Y").to_string(),
        DateStyle::Iso => date.format("%Y-%m-%d").to_string(),
    }
}

/// Render a time the way the store keeps it (`HH:MM`).
pub fn format_time(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Iterate the days in `[from, to]`.
pub fn days_between(from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
    from.iter_days().take_while(|d| *d <= to).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_both_formats_normalize_to_same_date() {
        let german = normalize_date("31.07.2025").unwrap();
        let iso = normalize_date("2025-07-31").unwrap();
        assert_eq!(german, iso);
        assert_eq!(german, d(2025, 7, 31));
    }

    #[test]
    fn test_single_digit_german_parts() {
        assert_eq!(normalize_date("4.8.2025").unwrap(), d(2025, 8, 4));
        assert_eq!(normalize_date(" 04.08.2025 ").unwrap(), d(2025, 8, 4));
    }

    #[test]
    fn test_impossible_dates_rejected() {
        assert!(matches!(
            normalize_date("31.04.2025"),
            Err(Error::InvalidDateFormat(_))
        ));
        assert!(matches!(
            normalize_date("2025-02-29"),
            Err(Error::InvalidDateFormat(_))
        ));
        // Leap year
        assert_eq!(normalize_date("29.02.2024").unwrap(), d(2024, 2, 29));
    }

    #[test]
    fn test_unknown_patterns_rejected() {
        for bad in ["", "2025/07/31", "07-31-2025", "31.07.25", "2025-7-31", "today"] {
            assert!(
                matches!(normalize_date(bad), Err(Error::InvalidDateFormat(_))),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_parse_stored_date_with_time_suffix() {
        assert_eq!(parse_stored_date("2025-07-31T00:00:00").unwrap(), d(2025, 7, 31));
        assert_eq!(parse_stored_date("2025-07-31 00:00:00.000").unwrap(), d(2025, 7, 31));
        assert_eq!(parse_stored_date("31.07.2025").unwrap(), d(2025, 7, 31));
        assert!(parse_stored_date("T08:00").is_err());
    }

    #[test]
    fn test_parse_time_variants() {
        let expected = NaiveTime::from_hms_opt(8, 30, 0).unwrap();
        assert_eq!(parse_time("08:30"), Some(expected));
        assert_eq!(parse_time("08:30:45"), Some(expected));
        assert_eq!(parse_time("08:30:00.0000000"), Some(expected));
        assert_eq!(parse_time("2025-07-31T08:30:00Z"), Some(expected));
        assert_eq!(parse_time(""), None);
        assert_eq!(parse_time("later"), None);
    }

    #[test]
    fn test_format_round_trip() {
        let date = d(2025, 7, 31);
        assert_eq!(format_date(date, DateStyle::German), "31.07.2025");
        assert_eq!(format_date(date, DateStyle::Iso), "2025-07-31");
        for style in [DateStyle::German, DateStyle::Iso] {
            assert_eq!(normalize_date(&format_date(date, style)).unwrap(), date);
        }
    }

    #[test]
    fn test_days_between() {
        let days = days_between(d(2025, 7, 30), d(2025, 8, 2));
        assert_eq!(days.len(), 4);
        assert_eq!(days[0], d(2025, 7, 30));
        assert_eq!(days[3], d(2025, 8, 2));
        assert!(days_between(d(2025, 8, 2), d(2025, 7, 30)).is_empty());
    }

    #[test]
    fn test_date_style_parse() {
        assert_eq!(DateStyle::parse("German").unwrap(), DateStyle::German);
        assert_eq!(DateStyle::parse("iso").unwrap(), DateStyle::Iso);
        assert!(DateStyle::parse("us").is_err());
    }
}
