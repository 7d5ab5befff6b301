use std::{sync::OnceLock, time::Instant};

use chrono::{Offset, TimeZone};
use chrono_tz::{OffsetComponents, Tz};

use switch_common::time::naive_utc;

/// Whole-hour offset of `tz` from UTC at `timestamp`. Fractional zones
/// truncate toward zero.
pub fn zone_offset_hours(tz: &Tz, timestamp: i64) -> i32 {
    tz.offset_from_utc_datetime(&naive_utc(timestamp))
        .fix()
        .local_minus_utc()
        / 3_600
}

pub fn is_daylight_saving(tz: &Tz, timestamp: i64) -> bool {
    tz.offset_from_utc_datetime(&naive_utc(timestamp))
        .dst_offset()
        != chrono::Duration::zero()
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use super::*;

    fn utc(year: i32, month: u32, day: u32, hour: u32) -> i64 {
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|date| date.and_hms_opt(hour, 0, 0))
            .unwrap()
            .and_utc()
            .timestamp()
    }

    #[test]
    fn follows_zone_rules() {
        let tz = chrono_tz::America::Los_Angeles;
        let winter = utc(2026, 1, 15, 12);
        let summer = utc(2026, 7, 15, 12);

        assert_eq!(zone_offset_hours(&tz, winter), -8);
        assert_eq!(zone_offset_hours(&tz, summer), -7);
        assert!(!is_daylight_saving(&tz, winter));
        assert!(is_daylight_saving(&tz, summer));
    }

    #[test]
    fn half_hour_zones_truncate() {
        assert_eq!(zone_offset_hours(&chrono_tz::Asia::Kolkata, utc(2026, 3, 1, 0)), 5);
        assert_eq!(zone_offset_hours(&chrono_tz::UTC, utc(2026, 3, 1, 0)), 0);
    }
}
