use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::astronomy::AstronomyState;

pub const ROLLBACK_HOUR: i32 = 3;

const SECONDS_PER_HOUR: i64 = 3_600;

pub trait Clock {
    fn now(&self) -> i64;

    fn zone_offset(&self, timestamp: i64) -> i32;

    fn is_daylight_saving(&self, timestamp: i64) -> bool;

    fn millis(&self) -> u64;

    fn sync_from_network(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TimeSymbol {
    Sunrise,
    Sunset,
    Clock { hour: i32, minute: i32 },
}

impl TimeSymbol {
    pub fn parse(text: &str) -> Self {
        match text {
            "sunrise" => Self::Sunrise,
            "sunset" => Self::Sunset,
            other => {
                let (hour, minute) = parse_hour_minute(other);
                Self::Clock { hour, minute }
            }
        }
    }

    pub fn is_astronomical(self) -> bool {
        matches!(self, Self::Sunrise | Self::Sunset)
    }
}

impl fmt::Display for TimeSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sunrise => f.write_str("sunrise"),
            Self::Sunset => f.write_str("sunset"),
            Self::Clock { hour, minute } => write!(f, "{hour}:{minute:02}"),
        }
    }
}

impl From<String> for TimeSymbol {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<TimeSymbol> for String {
    fn from(value: TimeSymbol) -> Self {
        value.to_string()
    }
}

pub fn naive_utc(timestamp: i64) -> NaiveDateTime {
    DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.naive_utc())
        .unwrap_or_default()
}

pub fn local_time<C: Clock + ?Sized>(clock: &C, timestamp: i64) -> NaiveDateTime {
    let offset = i64::from(clock.zone_offset(timestamp));
    naive_utc(timestamp.saturating_add(offset * SECONDS_PER_HOUR))
}

pub fn local_hour<C: Clock + ?Sized>(clock: &C, timestamp: i64) -> i32 {
    local_time(clock, timestamp).hour() as i32
}

pub fn local_minute<C: Clock + ?Sized>(clock: &C, timestamp: i64) -> i32 {
    local_time(clock, timestamp).minute() as i32
}

pub fn local_second<C: Clock + ?Sized>(clock: &C, timestamp: i64) -> i32 {
    local_time(clock, timestamp).second() as i32
}

/// Timestamp of `hour:minute` on the clock's current local date.
///
/// The zone offset is subtracted from the requested hour before the
/// timestamp is built, so the result is the UTC instant of that local time.
/// Out-of-range components roll over into neighbouring hours and days.
pub fn resolve_named_time_today<C: Clock + ?Sized>(clock: &C, hour: i32, minute: i32) -> i64 {
    let now = clock.now();
    let offset = clock.zone_offset(now);
    let local_now = local_time(clock, now);

    let mut date = local_now.date();
    // Just after midnight, evening data still describes yesterday.
    if (local_now.hour() as i32) < ROLLBACK_HOUR && hour > ROLLBACK_HOUR {
        date = date.pred_opt().unwrap_or(date);
    }

    let resolved = date.and_time(NaiveTime::default())
        + Duration::hours(i64::from(hour) - i64::from(offset))
        + Duration::minutes(i64::from(minute));
    resolved.and_utc().timestamp()
}

/// Reads `H:MM` leniently. Malformed input yields
/// zeroed fields instead of an error.
pub fn parse_hour_minute(text: &str) -> (i32, i32) {
    let Some((hour, rest)) = scan_int(text) else {
        return (0, 0);
    };

    let minute = rest
        .strip_prefix(':')
        .and_then(scan_int)
        .map(|(minute, _)| minute)
        .unwrap_or(0);

    (hour, minute)
}

pub fn parse_clock_time(text: &str) -> Option<(u32, u32)> {
    let (hour, minute) = text.trim().split_once(':')?;
    if hour.is_empty() || minute.len() != 2 {
        return None;
    }
    let hour = hour.parse::<u32>().ok()?;
    let minute = minute.parse::<u32>().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

pub fn split_timestamp(timestamp: i64) -> (i32, i32) {
    let time = naive_utc(timestamp);
    (time.hour() as i32, time.minute() as i32)
}

pub fn resolve_symbol<C: Clock + ?Sized>(
    clock: &C,
    symbol: &TimeSymbol,
    astronomy: &AstronomyState,
) -> Option<i64> {
    match *symbol {
        TimeSymbol::Sunrise => astronomy.sunrise(),
        TimeSymbol::Sunset => astronomy.sunset(),
        TimeSymbol::Clock { hour, minute } => {
            Some(resolve_named_time_today(clock, hour, minute))
        }
    }
}

pub fn format_iso<C: Clock + ?Sized>(clock: &C, timestamp: i64) -> String {
    let local = local_time(clock, timestamp);
    let mut out = format!(
        "{}-{:02}-{:02}T{:02}:{:02}:{:02}",
        local.year(),
        local.month(),
        local.day(),
        local.hour(),
        local.minute(),
        local.second()
    );

    let offset = clock.zone_offset(timestamp);
    if (-24..24).contains(&offset) {
        let sign = if offset < 0 { '-' } else { '+' };
        out.push_str(&format!("{sign}{:02}00", offset.abs()));
    }
    out
}

pub(crate) fn leading_int(text: &str) -> i32 {
    scan_int(text).map(|(value, _)| value).unwrap_or(0)
}

fn scan_int(input: &str) -> Option<(i32, &str)> {
    let trimmed = input.trim_start();
    let bytes = trimmed.as_bytes();

    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let digits_start = end;
    while bytes.get(end).is_some_and(u8::is_ascii_digit) {
        end += 1;
    }
    if end == digits_start {
        return None;
    }

    let value = trimmed[..end].parse::<i32>().ok()?;
    Some((value, &trimmed[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{epoch, FakeClock};

    #[test]
    fn parses_hour_minute_leniently() {
        assert_eq!(parse_hour_minute("8:05"), (8, 5));
        assert_eq!(parse_hour_minute("18:30"), (18, 30));
        assert_eq!(parse_hour_minute(" 7: 9"), (7, 9));
        assert_eq!(parse_hour_minute("12"), (12, 0));
        assert_eq!(parse_hour_minute("12x:30"), (12, 0));
        assert_eq!(parse_hour_minute("noon"), (0, 0));
        assert_eq!(parse_hour_minute(""), (0, 0));
    }

    #[test]
    fn strict_clock_time_rejects_out_of_range() {
        assert_eq!(parse_clock_time("0:05"), Some((0, 5)));
        assert_eq!(parse_clock_time("23:59"), Some((23, 59)));
        assert_eq!(parse_clock_time("24:00"), None);
        assert_eq!(parse_clock_time("7:5"), None);
        assert_eq!(parse_clock_time("sunset"), None);
    }

    #[test]
    fn round_trips_without_offset() {
        let clock = FakeClock::at(epoch(2026, 3, 10, 12, 0, 0), 0);
        for (hour, minute) in [(4, 0), (8, 15), (12, 0), (18, 45), (23, 59)] {
            let resolved = resolve_named_time_today(&clock, hour, minute);
            assert_eq!(split_timestamp(resolved), (hour, minute));
        }
    }

    #[test]
    fn split_reflects_zone_offset() {
        let clock = FakeClock::at(epoch(2026, 3, 10, 17, 0, 0), -5);
        let resolved = resolve_named_time_today(&clock, 18, 30);
        assert_eq!(split_timestamp(resolved), (23, 30));
        assert_eq!(resolved, epoch(2026, 3, 10, 23, 30, 0));
    }

    #[test]
    fn late_hours_roll_back_just_after_midnight() {
        let clock = FakeClock::at(epoch(2026, 3, 10, 1, 0, 0), 0);
        let resolved = resolve_named_time_today(&clock, 22, 0);
        assert_eq!(resolved, epoch(2026, 3, 9, 22, 0, 0));

        // Early hours stay on today's date.
        let resolved = resolve_named_time_today(&clock, 2, 30);
        assert_eq!(resolved, epoch(2026, 3, 10, 2, 30, 0));
    }

    #[test]
    fn three_am_is_not_special_cased() {
        let clock = FakeClock::at(epoch(2026, 3, 10, 3, 0, 0), 0);
        assert_eq!(
            resolve_named_time_today(&clock, 22, 0),
            epoch(2026, 3, 10, 22, 0, 0)
        );

        let clock = FakeClock::at(epoch(2026, 3, 10, 1, 0, 0), 0);
        assert_eq!(
            resolve_named_time_today(&clock, 3, 0),
            epoch(2026, 3, 10, 3, 0, 0)
        );
    }

    #[test]
    fn symbols_parse_and_display() {
        assert_eq!(TimeSymbol::parse("sunrise"), TimeSymbol::Sunrise);
        assert_eq!(TimeSymbol::parse("sunset"), TimeSymbol::Sunset);
        assert_eq!(
            TimeSymbol::parse("Sunset"),
            TimeSymbol::Clock { hour: 0, minute: 0 }
        );
        assert_eq!(TimeSymbol::parse("6:30").to_string(), "6:30");
        assert!(TimeSymbol::Sunrise.is_astronomical());
        assert!(!TimeSymbol::parse("6:30").is_astronomical());
    }

    #[test]
    fn unset_astronomy_leaves_symbol_unresolved() {
        let clock = FakeClock::at(epoch(2026, 3, 10, 12, 0, 0), 0);
        let astronomy = AstronomyState::default();
        assert_eq!(resolve_symbol(&clock, &TimeSymbol::Sunset, &astronomy), None);
        assert_eq!(
            resolve_symbol(&clock, &TimeSymbol::parse("9:00"), &astronomy),
            Some(epoch(2026, 3, 10, 9, 0, 0))
        );
    }

    #[test]
    fn iso_string_carries_offset() {
        let clock = FakeClock::at(epoch(2026, 3, 10, 14, 5, 9), -5);
        assert_eq!(
            format_iso(&clock, clock.now()),
            "2026-03-10T09:05:09-0500"
        );
    }

    #[test]
    fn leading_int_matches_atoi() {
        assert_eq!(leading_int("42"), 42);
        assert_eq!(leading_int(" -7abc"), -7);
        assert_eq!(leading_int("abc"), 0);
    }
}
