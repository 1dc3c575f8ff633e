/// Time handling.  Query ranges are expressed with `Timestamp`, which is always UTC; record
/// timestamps are plain Unix seconds (i64), and the truncation and stepping functions used for
/// folding operate on those.  All binning is by UTC.
use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};

pub type Timestamp = DateTime<Utc>;

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;

// 1970-01-01 was a Thursday, so the first Monday is 1970-01-05.
const FIRST_MONDAY: i64 = 4 * DAY;

pub fn now() -> Timestamp {
    Utc::now()
}

pub fn epoch() -> Timestamp {
    Utc.timestamp_opt(0, 0).unwrap()
}

/// A time that should not be in any sample record.

pub fn far_future() -> Timestamp {
    timestamp_from_ymd(2200, 1, 1)
}

pub fn timestamp_from_ymdhms(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> Timestamp {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .unwrap()
}

pub fn timestamp_from_ymd(year: i32, month: u32, day: u32) -> Timestamp {
    timestamp_from_ymdhms(year, month, day, 0, 0, 0)
}

/// Unix seconds to Timestamp, None if out of range.

pub fn timestamp_from_unix(t: i64) -> Option<Timestamp> {
    Utc.timestamp_opt(t, 0).single()
}

/// Parse an RFC3339 timestamp with time zone, and move it to UTC.

pub fn parse_timestamp(s: &str) -> Result<Timestamp> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// Midnight at the start of the day of `t`.

pub fn this_day(t: Timestamp) -> Timestamp {
    Utc.from_utc_datetime(
        &NaiveDate::from_ymd_opt(t.year(), t.month(), t.day())
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap(),
    )
}

/// Midnight at the start of the next day, unless `t` is already midnight.  Idempotent.

pub fn roundup_day(t: Timestamp) -> Timestamp {
    this_day(t + Duration::seconds(DAY - 1))
}

/// Returns vector of (year, month, day) with times inclusive between the days of t1 and t2; sub-day
/// information in t1 and t2 is ignored.

pub fn date_range(t1: Timestamp, t2: Timestamp) -> Vec<(i32, u32, u32)> {
    let mut date_range = Vec::new();
    let mut current_date = this_day(t1);
    let last = this_day(t2);
    while current_date <= last {
        date_range.push((current_date.year(), current_date.month(), current_date.day()));
        current_date += Duration::days(1);
    }
    date_range
}

pub fn truncate_to_half_hour(t: i64) -> i64 {
    t - t.rem_euclid(30 * MINUTE)
}

pub fn truncate_to_hour(t: i64) -> i64 {
    t - t.rem_euclid(HOUR)
}

pub fn truncate_to_half_day(t: i64) -> i64 {
    t - t.rem_euclid(12 * HOUR)
}

pub fn truncate_to_day(t: i64) -> i64 {
    t - t.rem_euclid(DAY)
}

// Weeks start on Monday.
pub fn truncate_to_week(t: i64) -> i64 {
    t - (t - FIRST_MONDAY).rem_euclid(WEEK)
}

pub fn add_half_hour(t: i64) -> i64 {
    t + 30 * MINUTE
}

pub fn add_hour(t: i64) -> i64 {
    t + HOUR
}

pub fn add_half_day(t: i64) -> i64 {
    t + 12 * HOUR
}

pub fn add_day(t: i64) -> i64 {
    t + DAY
}

pub fn add_week(t: i64) -> i64 {
    t + WEEK
}

#[test]
fn test_date_range() {
    let from = timestamp_from_ymdhms(2023, 5, 30, 5, 20, 33);
    let to = timestamp_from_ymd(2023, 6, 4);
    assert!(date_range(from, to).eq(&vec![
        (2023, 5, 30),
        (2023, 5, 31),
        (2023, 6, 1),
        (2023, 6, 2),
        (2023, 6, 3),
        (2023, 6, 4)
    ]));
}

// This tests:
//  - this_day drops the time of day
//  - roundup_day moves to the next midnight and is idempotent

#[test]
fn test_day_rounding() {
    let t = timestamp_from_ymdhms(2023, 5, 30, 5, 20, 33);
    assert!(this_day(t) == timestamp_from_ymd(2023, 5, 30));
    assert!(roundup_day(t) == timestamp_from_ymd(2023, 5, 31));
    assert!(roundup_day(roundup_day(t)) == timestamp_from_ymd(2023, 5, 31));
    assert!(roundup_day(timestamp_from_ymd(2023, 12, 31)) == timestamp_from_ymd(2023, 12, 31));
    assert!(roundup_day(timestamp_from_ymdhms(2023, 12, 31, 0, 0, 1)) == timestamp_from_ymd(2024, 1, 1));
}

#[test]
fn test_parse_timestamp() {
    let t = parse_timestamp("2024-06-03T00:00:01+02:00").unwrap();
    assert!(t == timestamp_from_ymdhms(2024, 6, 2, 22, 0, 1));
    assert!(this_day(t) == timestamp_from_ymd(2024, 6, 2));
    assert!(parse_timestamp("2024-06-03").is_err());
}

// This tests:
//  - the truncation functions against chrono's calendar, including a Monday-based week
//  - the add functions step exactly to the next bucket

#[test]
fn test_truncate() {
    // Wednesday
    let t = timestamp_from_ymdhms(2024, 6, 5, 13, 47, 12).timestamp();
    assert!(truncate_to_half_hour(t) == timestamp_from_ymdhms(2024, 6, 5, 13, 30, 0).timestamp());
    assert!(truncate_to_hour(t) == timestamp_from_ymdhms(2024, 6, 5, 13, 0, 0).timestamp());
    assert!(truncate_to_half_day(t) == timestamp_from_ymdhms(2024, 6, 5, 12, 0, 0).timestamp());
    assert!(truncate_to_day(t) == timestamp_from_ymd(2024, 6, 5).timestamp());
    assert!(truncate_to_week(t) == timestamp_from_ymd(2024, 6, 3).timestamp());

    // Monday and Sunday
    let monday = timestamp_from_ymd(2024, 6, 3).timestamp();
    let sunday = timestamp_from_ymdhms(2024, 6, 9, 23, 59, 59).timestamp();
    assert!(truncate_to_week(monday) == monday);
    assert!(truncate_to_week(sunday) == monday);
    assert!(add_week(truncate_to_week(sunday)) == timestamp_from_ymd(2024, 6, 10).timestamp());

    let morning = timestamp_from_ymdhms(2024, 6, 5, 11, 29, 59).timestamp();
    assert!(truncate_to_half_hour(morning) == timestamp_from_ymdhms(2024, 6, 5, 11, 0, 0).timestamp());
    assert!(truncate_to_half_day(morning) == timestamp_from_ymd(2024, 6, 5).timestamp());
    assert!(add_half_hour(truncate_to_half_hour(morning)) == truncate_to_half_hour(morning + 1));
    let noon = timestamp_from_ymdhms(2024, 6, 5, 12, 0, 0).timestamp();
    assert!(add_hour(truncate_to_hour(morning)) == noon);
    assert!(add_half_day(truncate_to_half_day(morning)) == noon);
    assert!(add_day(truncate_to_day(morning)) == timestamp_from_ymd(2024, 6, 6).timestamp());

    // Before the epoch, the truncation still rounds down.
    assert!(truncate_to_day(-1) == -DAY);
    assert!(timestamp_from_unix(0) == Some(epoch()));
    assert!(far_future() > now());
}
