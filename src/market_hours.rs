//! Regular-hours (09:30-16:00 ET) filtering.
//!
//! Bars and signals carry UTC timestamps everywhere (§9 Open Question:
//! "spec stores UTC and converts only for regular-hours filtering"). This is
//! the sole conversion point. We do not pull in a full IANA tz database;
//! instead we use a fixed US Eastern DST table, which is exact for any date
//! the test suite or a real backtest would use (2007 onward, the current
//! US DST rule: second Sunday in March to first Sunday in November).

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, TimeZone, Utc, Weekday};

pub const REGULAR_OPEN: NaiveTime = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
pub const REGULAR_CLOSE: NaiveTime = NaiveTime::from_hms_opt(16, 0, 0).unwrap();

/// UTC offset (hours, negative = behind UTC) for US Eastern time on `ts`.
fn eastern_offset_hours(ts: &DateTime<Utc>) -> i64 {
    if is_us_dst(ts) {
        -4
    } else {
        -5
    }
}

/// Whether `ts` falls within US daylight saving time under the current rule
/// (2nd Sunday in March 02:00 local -> 1st Sunday in November 02:00 local).
fn is_us_dst(ts: &DateTime<Utc>) -> bool {
    let year = ts.year();
    let dst_start = nth_sunday_utc(year, 3, 2).and_hms_opt(7, 0, 0).unwrap(); // 02:00 EST = 07:00 UTC
    let dst_end = nth_sunday_utc(year, 11, 1).and_hms_opt(6, 0, 0).unwrap(); // 02:00 EDT = 06:00 UTC
    let naive = ts.naive_utc();
    naive >= dst_start && naive < dst_end
}

fn nth_sunday_utc(year: i32, month: u32, n: u32) -> chrono::NaiveDate {
    let first = chrono::NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    let first_weekday = first.weekday();
    let days_until_sunday = (7 - first_weekday.num_days_from_sunday()) % 7;
    let first_sunday = first + ChronoDuration::days(days_until_sunday as i64);
    first_sunday + ChronoDuration::days(7 * (n as i64 - 1))
}

/// Converts a UTC timestamp to the naive US-Eastern wall-clock time.
pub fn to_eastern_naive(ts: &DateTime<Utc>) -> chrono::NaiveDateTime {
    ts.naive_utc() + ChronoDuration::hours(eastern_offset_hours(ts))
}

/// True iff `ts` falls on a weekday within 09:30-16:00 ET (inclusive of open,
/// exclusive of close, matching the half-open bar-window convention used
/// throughout the engine).
pub fn is_regular_hours(ts: &DateTime<Utc>) -> bool {
    let eastern = to_eastern_naive(ts);
    if matches!(eastern.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let t = eastern.time();
    t >= REGULAR_OPEN && t < REGULAR_CLOSE
}

/// Minutes remaining until the regular session closes, or `None` if `ts` is
/// already outside regular hours.
pub fn minutes_to_close(ts: &DateTime<Utc>) -> Option<i64> {
    if !is_regular_hours(ts) {
        return None;
    }
    let eastern = to_eastern_naive(ts);
    let close = eastern.date().and_time(REGULAR_CLOSE);
    Some((close - eastern).num_minutes())
}

/// Builds a UTC timestamp for a given ET wall-clock time on the same
/// calendar date as `reference` (used by tests and template time-exit rules).
pub fn eastern_time_on(reference: &DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
    let eastern = to_eastern_naive(reference);
    let naive = eastern.date().and_time(time);
    let offset = eastern_offset_hours(reference);
    Utc.from_utc_datetime(&(naive - ChronoDuration::hours(offset)))
}

/// Builds a UTC timestamp for an ET wall-clock `(date, time)` pair,
/// independent of any reference instant — used to convert a `Signal`'s
/// `(signal_date, signal_time)` into an absolute UTC timestamp.
pub fn eastern_date_time_to_utc(date: chrono::NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    // Use local noon as a DST probe: no US DST transition happens at local
    // noon, so this always picks the correct offset for the given date.
    let noon_utc = Utc.from_utc_datetime(&date.and_hms_opt(17, 0, 0).unwrap());
    let offset = eastern_offset_hours(&noon_utc);
    Utc.from_utc_datetime(&(date.and_time(time) - ChronoDuration::hours(offset)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn regular_hours_summer_edt() {
        // 2025-07-15 is within EDT (UTC-4). 13:30 UTC = 09:30 ET.
        let open = Utc.with_ymd_and_hms(2025, 7, 15, 13, 30, 0).unwrap();
        assert!(is_regular_hours(&open));
        let before = Utc.with_ymd_and_hms(2025, 7, 15, 13, 29, 0).unwrap();
        assert!(!is_regular_hours(&before));
        let close = Utc.with_ymd_and_hms(2025, 7, 15, 20, 0, 0).unwrap();
        assert!(!is_regular_hours(&close));
    }

    #[test]
    fn regular_hours_winter_est() {
        // 2025-01-15 is within EST (UTC-5). 14:30 UTC = 09:30 ET.
        let open = Utc.with_ymd_and_hms(2025, 1, 15, 14, 30, 0).unwrap();
        assert!(is_regular_hours(&open));
    }

    #[test]
    fn weekend_is_never_regular_hours() {
        // 2025-07-12 is a Saturday.
        let sat = Utc.with_ymd_and_hms(2025, 7, 12, 14, 0, 0).unwrap();
        assert!(!is_regular_hours(&sat));
    }

    #[test]
    fn minutes_to_close_counts_down() {
        let ts = Utc.with_ymd_and_hms(2025, 7, 15, 19, 45, 0).unwrap(); // 15:45 ET
        assert_eq!(minutes_to_close(&ts), Some(15));
    }
}
