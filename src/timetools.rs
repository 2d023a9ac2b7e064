//! Day numbers, calendar month stepping, and CF-style time units.
//!
//! Throughout this crate, times are represented as "day numbers": the
//! (possibly fractional) number of days since 2000-01-01 00:00. This keeps
//! time axes as plain `f64` arrays that can be sliced exactly like any
//! other coordinate, while [`day_number_to_datetime`] and
//! [`datetime_to_day_number`] convert to and from [`chrono`] types when
//! calendar logic is needed.
use std::{fmt::Display, str::FromStr, sync::OnceLock};

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use regex::Regex;

use crate::error::TimeError;

const MILLISECONDS_PER_DAY: f64 = 86_400_000.0;

/// The datetime that corresponds to day number 0.
pub fn day_number_origin() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("2000-01-01 00:00 is a valid datetime")
}

/// Convert a datetime into a fractional number of days since 2000-01-01 00:00.
pub fn datetime_to_day_number(dt: NaiveDateTime) -> f64 {
    let delta = dt - day_number_origin();
    delta.num_milliseconds() as f64 / MILLISECONDS_PER_DAY
}

/// Convert a day number back into a datetime, rounded to the nearest millisecond.
pub fn day_number_to_datetime(day_number: f64) -> Result<NaiveDateTime, TimeError> {
    if !day_number.is_finite() {
        return Err(TimeError::OutOfRange(day_number));
    }
    let millis = (day_number * MILLISECONDS_PER_DAY).round();
    if millis.abs() > i64::MAX as f64 / 2.0 {
        return Err(TimeError::OutOfRange(day_number));
    }
    day_number_origin()
        .checked_add_signed(Duration::milliseconds(millis as i64))
        .ok_or(TimeError::OutOfRange(day_number))
}

/// Day number of midnight on the given calendar date.
pub fn ymd_to_day_number(year: i32, month: u32, day: u32) -> Result<f64, TimeError> {
    let date = NaiveDate::from_ymd_opt(year, month, day)
        .ok_or(TimeError::InvalidYearMonthDay(year, month, day))?;
    Ok(datetime_to_day_number(date.and_time(NaiveTime::MIN)))
}

pub fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        _ => 28,
    }
}

/// Step a datetime by a whole number of calendar months.
///
/// The day of month is clamped to the length of the target month (so
/// January 31 plus one month is February 28 or 29) and the time of day is
/// preserved.
pub fn add_months(dt: NaiveDateTime, months: i32) -> Result<NaiveDateTime, TimeError> {
    let month0 = dt.year() * 12 + dt.month0() as i32 + months;
    let year = month0.div_euclid(12);
    let month = month0.rem_euclid(12) as u32 + 1;
    let day = dt.day().min(days_in_month(year, month));
    let date =
        NaiveDate::from_ymd_opt(year, month, day).ok_or(TimeError::InvalidYearMonthDay(year, month, day))?;
    Ok(date.and_time(dt.time()))
}

/// Same as [`add_months`] but operating on day numbers.
pub fn add_months_to_day_number(day_number: f64, months: i32) -> Result<f64, TimeError> {
    let dt = day_number_to_datetime(day_number)?;
    Ok(datetime_to_day_number(add_months(dt, months)?))
}

/// The fractional hour of day of a day number, mostly for log messages.
pub fn hour_of_day(day_number: f64) -> Result<u32, TimeError> {
    Ok(day_number_to_datetime(day_number)?.hour())
}

/// Time units recognized in "<unit> since <origin>" strings
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Months,
    Years,
}

impl FromStr for TimeUnit {
    type Err = TimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "second" | "seconds" | "sec" | "secs" | "s" => Ok(Self::Seconds),
            "minute" | "minutes" | "min" | "mins" => Ok(Self::Minutes),
            "hour" | "hours" | "hr" | "hrs" | "h" => Ok(Self::Hours),
            "day" | "days" | "d" => Ok(Self::Days),
            "month" | "months" => Ok(Self::Months),
            "year" | "years" => Ok(Self::Years),
            _ => Err(TimeError::UnsupportedUnit(s.to_string())),
        }
    }
}

impl TimeUnit {
    /// Number of days in one of this unit, if the unit has a fixed length.
    fn days_per_unit(&self) -> Option<f64> {
        match self {
            TimeUnit::Seconds => Some(1.0 / 86400.0),
            TimeUnit::Minutes => Some(1.0 / 1440.0),
            TimeUnit::Hours => Some(1.0 / 24.0),
            TimeUnit::Days => Some(1.0),
            TimeUnit::Months | TimeUnit::Years => None,
        }
    }
}

/// A parsed "<unit> since <origin>" time unit string.
///
/// Both spaces and underscores are accepted as delimiters, so
/// `"hours since 1900-01-01 00:00:0.0"` and `"days_since_2000-01-01"` both
/// parse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeUnits {
    pub unit: TimeUnit,
    pub origin: NaiveDateTime,
}

impl Display for TimeUnits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} since {}", self.unit, self.origin.format("%Y-%m-%d %H:%M:%S"))
    }
}

impl FromStr for TimeUnits {
    type Err = TimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static UNITS_RE: OnceLock<Regex> = OnceLock::new();
        let re = UNITS_RE.get_or_init(|| {
            Regex::new(r"(?i)^\s*([a-z]+)[\s_]+since[\s_]+(.+?)\s*$").expect("time units regex is valid")
        });

        let caps = re
            .captures(s)
            .ok_or_else(|| TimeError::units(s, "expected '<unit> since <origin>'"))?;
        let unit = caps[1].parse::<TimeUnit>()?;
        let origin = parse_origin(&caps[2]).map_err(|reason| TimeError::units(s, reason))?;
        Ok(Self { unit, origin })
    }
}

impl TimeUnits {
    /// Convert one stored time value to a day number.
    pub fn to_day_number(&self, value: f64) -> Result<f64, TimeError> {
        let origin = datetime_to_day_number(self.origin);
        if let Some(factor) = self.unit.days_per_unit() {
            return Ok(origin + value * factor);
        }

        let months = match self.unit {
            TimeUnit::Months => value,
            _ => value * 12.0,
        };
        if months.fract() != 0.0 {
            let unit = if self.unit == TimeUnit::Months { "months" } else { "years" };
            return Err(TimeError::NonIntegralCalendarOffset { unit, value });
        }
        Ok(datetime_to_day_number(add_months(self.origin, months as i32)?))
    }

    /// Convert stored time values to day numbers.
    pub fn decode(&self, values: &[f64]) -> Result<Vec<f64>, TimeError> {
        values.iter().map(|&v| self.to_day_number(v)).collect()
    }
}

/// Parse the origin part of a time unit string.
///
/// Accepts a `Y-M-D` date with unpadded fields, an optional `H[:M[:S[.f]]]`
/// time separated by whitespace, an underscore or a `T`, and ignores a
/// trailing UTC marker or zero offset.
fn parse_origin(s: &str) -> Result<NaiveDateTime, String> {
    static SEP_RE: OnceLock<Regex> = OnceLock::new();
    let sep = SEP_RE.get_or_init(|| Regex::new(r"(\d)[T_](\d)").expect("separator regex is valid"));
    let normalized = sep.replace_all(s.trim(), "$1 $2").replace('_', " ");

    let mut parts = normalized.split_whitespace();
    let date_part = parts.next().ok_or("missing origin date")?;
    let date = parse_date(date_part)?;

    let time = match parts.next() {
        Some(t) if !is_utc_marker(t) => parse_time(t.trim_end_matches(['Z', 'z']))?,
        _ => NaiveTime::MIN,
    };

    for extra in parts {
        if !is_utc_marker(extra) {
            return Err(format!("unexpected trailing text '{extra}' in origin"));
        }
    }

    Ok(date.and_time(time))
}

fn is_utc_marker(s: &str) -> bool {
    let upper = s.to_ascii_uppercase();
    matches!(upper.as_str(), "UTC" | "GMT" | "Z")
        || ((s.starts_with('+') || s.starts_with('-'))
            && s[1..].chars().all(|c| c == '0' || c == ':'))
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    let fields: Vec<&str> = s.split('-').collect();
    if fields.len() != 3 {
        return Err(format!("origin date '{s}' is not in Y-M-D form"));
    }
    let year: i32 = fields[0].parse().map_err(|_| format!("bad year in '{s}'"))?;
    let month: u32 = fields[1].parse().map_err(|_| format!("bad month in '{s}'"))?;
    let day: u32 = fields[2].parse().map_err(|_| format!("bad day in '{s}'"))?;
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| format!("'{s}' is not a valid date"))
}

fn parse_time(s: &str) -> Result<NaiveTime, String> {
    let fields: Vec<&str> = s.split(':').collect();
    if fields.is_empty() || fields.len() > 3 {
        return Err(format!("origin time '{s}' is not in H:M:S form"));
    }
    let hour: u32 = fields[0].parse().map_err(|_| format!("bad hour in '{s}'"))?;
    let minute: u32 = match fields.get(1) {
        Some(m) => m.parse().map_err(|_| format!("bad minute in '{s}'"))?,
        None => 0,
    };
    let seconds: f64 = match fields.get(2) {
        Some(sec) => sec.parse().map_err(|_| format!("bad second in '{s}'"))?,
        None => 0.0,
    };
    if !(0.0..60.0).contains(&seconds) {
        return Err(format!("bad second in '{s}'"));
    }
    let whole = seconds.trunc() as u32;
    let millis = ((seconds - seconds.trunc()) * 1000.0).round() as u32;
    NaiveTime::from_hms_milli_opt(hour, minute, whole, millis.min(999))
        .ok_or_else(|| format!("'{s}' is not a valid time"))
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use rstest::rstest;

    use super::*;

    fn dt(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    #[test]
    fn test_day_number_round_trip() {
        let t = dt(2024, 2, 29, 18);
        let dn = datetime_to_day_number(t);
        assert_abs_diff_eq!(dn, 8825.75);
        assert_eq!(day_number_to_datetime(dn).unwrap(), t);
        assert_abs_diff_eq!(ymd_to_day_number(2000, 1, 2).unwrap(), 1.0);
        assert_abs_diff_eq!(ymd_to_day_number(1999, 12, 31).unwrap(), -1.0);
    }

    #[rstest]
    #[case(dt(2021, 1, 31, 6), 1, dt(2021, 2, 28, 6))]
    #[case(dt(2020, 1, 31, 0), 1, dt(2020, 2, 29, 0))]
    #[case(dt(2020, 11, 15, 0), 3, dt(2021, 2, 15, 0))]
    #[case(dt(2020, 3, 31, 12), -1, dt(2020, 2, 29, 12))]
    #[case(dt(2020, 1, 1, 0), -13, dt(2018, 12, 1, 0))]
    fn test_add_months(#[case] start: NaiveDateTime, #[case] n: i32, #[case] expected: NaiveDateTime) {
        assert_eq!(add_months(start, n).unwrap(), expected);
    }

    #[rstest]
    #[case("days since 2000-01-01 00:00:00", TimeUnit::Days, dt(2000, 1, 1, 0))]
    #[case("hours since 1800-1-1 00:00:0.0", TimeUnit::Hours, dt(1800, 1, 1, 0))]
    #[case("days_since_2000-01-01", TimeUnit::Days, dt(2000, 1, 1, 0))]
    #[case("Seconds since 1970-01-01T00:00:00Z", TimeUnit::Seconds, dt(1970, 1, 1, 0))]
    #[case("months since 1960-01-01 12:00:00 UTC", TimeUnit::Months, dt(1960, 1, 1, 12))]
    #[case("hour since 1900-01-01 06", TimeUnit::Hours, dt(1900, 1, 1, 6))]
    fn test_parse_units(#[case] s: &str, #[case] unit: TimeUnit, #[case] origin: NaiveDateTime) {
        let units: TimeUnits = s.parse().unwrap();
        assert_eq!(units.unit, unit);
        assert_eq!(units.origin, origin);
    }

    #[rstest]
    #[case("days after 2000-01-01")]
    #[case("fortnights since 2000-01-01")]
    #[case("days since yesterday")]
    #[case("days since 2000-02-30")]
    #[case("")]
    fn test_parse_units_errors(#[case] s: &str) {
        assert!(s.parse::<TimeUnits>().is_err());
    }

    #[test]
    fn test_decode_fixed_units() {
        let units: TimeUnits = "hours since 2000-01-02 00:00:00".parse().unwrap();
        let decoded = units.decode(&[0.0, 6.0, 36.0]).unwrap();
        assert_abs_diff_eq!(decoded.as_slice(), [1.0, 1.25, 2.5].as_slice());

        let units: TimeUnits = "minutes since 1999-12-31".parse().unwrap();
        assert_abs_diff_eq!(units.to_day_number(2160.0).unwrap(), 0.5);
    }

    #[test]
    fn test_decode_calendar_units() {
        let units: TimeUnits = "months since 2000-01-31".parse().unwrap();
        let decoded = units.decode(&[0.0, 1.0, 13.0]).unwrap();
        let expected = [
            ymd_to_day_number(2000, 1, 31).unwrap(),
            ymd_to_day_number(2000, 2, 29).unwrap(),
            ymd_to_day_number(2001, 2, 28).unwrap(),
        ];
        assert_abs_diff_eq!(decoded.as_slice(), expected.as_slice());

        let units: TimeUnits = "years since 2000-02-29".parse().unwrap();
        assert_abs_diff_eq!(
            units.to_day_number(1.0).unwrap(),
            ymd_to_day_number(2001, 2, 28).unwrap()
        );
        assert!(units.to_day_number(0.5).is_err());
    }

    #[test]
    fn test_days_in_month() {
        assert_eq!(days_in_month(2000, 2), 29);
        assert_eq!(days_in_month(1900, 2), 28);
        assert_eq!(days_in_month(2023, 2), 28);
        assert_eq!(days_in_month(2023, 12), 31);
        assert_eq!(days_in_month(2023, 11), 30);
    }
}
