//! Timestamp alignment and window slicing (unix seconds, UTC)

use chrono::{DateTime, NaiveDate};

use crate::constants::{ONE_DAY_SEC, ONE_HOUR_SEC};

pub fn start_of_hour(timestamp: i64) -> i64 {
    timestamp - timestamp.rem_euclid(ONE_HOUR_SEC)
}

pub fn start_of_day(timestamp: i64) -> i64 {
    timestamp - timestamp.rem_euclid(ONE_DAY_SEC)
}

pub fn utc_date(timestamp: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(timestamp, 0).map(|dt| dt.date_naive())
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: i64,
    pub end: i64,
}

/// Partition `[start, end)` into consecutive windows of at most `duration` seconds
pub fn slice_windows(start: i64, end: i64, duration: i64) -> Vec<Window> {
    let mut windows = Vec::new();
    if duration <= 0 {
        return windows;
    }
    let mut cursor = start;
    while cursor < end {
        let window_end = (cursor + duration).min(end);
        windows.push(Window {
            start: cursor,
            end: window_end,
        });
        cursor += duration;
    }
    windows
}

/// Hour boundaries in `[from, to)`
pub fn hours_between(from: i64, to: i64) -> impl Iterator<Item = i64> {
    let first = if from.rem_euclid(ONE_HOUR_SEC) == 0 {
        from
    } else {
        start_of_hour(from) + ONE_HOUR_SEC
    };
    (0..)
        .map(move |i| first + i * ONE_HOUR_SEC)
        .take_while(move |hour| *hour < to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        // 2024-01-01 13:45:10 UTC
        let ts = 1_704_116_710;
        assert_eq!(start_of_hour(ts), 1_704_114_000);
        assert_eq!(start_of_day(ts), 1_704_067_200);
        assert_eq!(start_of_hour(1_704_114_000), 1_704_114_000);
        assert_eq!(
            utc_date(ts),
            NaiveDate::from_ymd_opt(2024, 1, 1)
        );
    }

    #[test]
    fn test_slice_windows_covers_range_without_overlap() {
        let windows = slice_windows(100, 1_000, 300);
        assert_eq!(
            windows,
            vec![
                Window { start: 100, end: 400 },
                Window { start: 400, end: 700 },
                Window { start: 700, end: 1_000 },
            ]
        );

        let ragged = slice_windows(0, 650, 300);
        assert_eq!(ragged.last(), Some(&Window { start: 600, end: 650 }));
    }

    #[test]
    fn test_slice_windows_empty_range() {
        assert!(slice_windows(500, 500, 300).is_empty());
        assert!(slice_windows(600, 500, 300).is_empty());
        assert!(slice_windows(0, 500, 0).is_empty());
    }

    #[test]
    fn test_hours_between() {
        let hours: Vec<_> = hours_between(3_599, 3 * 3_600 + 1).collect();
        assert_eq!(hours, vec![3_600, 7_200, 10_800]);

        let aligned: Vec<_> = hours_between(3_600, 7_200).collect();
        assert_eq!(aligned, vec![3_600]);
    }
}
