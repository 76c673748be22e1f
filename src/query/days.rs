//! Day-range planner
//!
//! Search partitions are UTC calendar days (`CreatedAtDate`). A time range
//! maps to every day it touches.

use chrono::{DateTime, Utc};

use crate::utils::ISO8601_DATE_FORMAT;

/// Every UTC day overlapping `[start, end]`, ascending, both ends included.
///
/// Returns an empty list when `start` is after `end`.
pub fn days_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<String> {
    let mut days = Vec::new();
    if start > end {
        return days;
    }

    let last = end.date_naive();
    let mut day = start.date_naive();
    while day <= last {
        days.push(day.format(ISO8601_DATE_FORMAT).to_string());
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    days
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_range_within_month() {
        let start = Utc.with_ymd_and_hms(2021, 4, 10, 8, 5, 0).unwrap();
        let end = start + Duration::hours(24 * 4);

        assert_eq!(
            days_between(start, end),
            vec!["2021-04-10", "2021-04-11", "2021-04-12", "2021-04-13", "2021-04-14"]
        );
    }

    #[test]
    fn test_range_across_month() {
        let start = Utc.with_ymd_and_hms(2021, 8, 30, 8, 5, 0).unwrap();
        let end = start + Duration::hours(24 * 2);

        assert_eq!(
            days_between(start, end),
            vec!["2021-08-30", "2021-08-31", "2021-09-01"]
        );
    }

    #[test]
    fn test_range_across_year_and_leap_day() {
        let start = Utc.with_ymd_and_hms(2019, 12, 31, 23, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2020, 1, 1, 0, 30, 0).unwrap();
        assert_eq!(days_between(start, end), vec!["2019-12-31", "2020-01-01"]);

        let start = Utc.with_ymd_and_hms(2020, 2, 28, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2020, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(
            days_between(start, end),
            vec!["2020-02-28", "2020-02-29", "2020-03-01"]
        );
    }

    #[test]
    fn test_single_day_and_inverted_range() {
        let start = Utc.with_ymd_and_hms(2021, 4, 10, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2021, 4, 10, 23, 59, 59).unwrap();

        assert_eq!(days_between(start, end), vec!["2021-04-10"]);
        assert_eq!(days_between(start, start), vec!["2021-04-10"]);
        assert!(days_between(end, start).is_empty());
    }

    #[test]
    fn test_sequence_is_gap_free() {
        let start = Utc.with_ymd_and_hms(2021, 1, 1, 3, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2021, 12, 31, 22, 0, 0).unwrap();
        let days = days_between(start, end);

        assert_eq!(days.len(), 365);
        assert!(days.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(days.first().unwrap(), "2021-01-01");
        assert_eq!(days.last().unwrap(), "2021-12-31");
    }
}
