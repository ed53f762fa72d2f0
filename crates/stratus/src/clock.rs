//! Local-time arithmetic over a fixed UTC offset.
//!
//! All daily-reset logic (quota counters, fog state, verification days)
//! keys off an explicit *local day index* — whole days since the Unix
//! epoch in site-local time — rather than checking `hour == 0`, so a run
//! that doesn't execute exactly at midnight never skips a reset.

/// Seconds in one hour.
pub const HOUR_SECS: i64 = 3600;

/// Seconds in one day.
pub const DAY_SECS: i64 = 86_400;

/// Whole local days since the Unix epoch for a UTC timestamp.
pub fn local_day_index(ts: i64, utc_offset_minutes: i32) -> i64 {
    (ts + i64::from(utc_offset_minutes) * 60).div_euclid(DAY_SECS)
}

/// Local hour of day (0-23) for a UTC timestamp.
pub fn local_hour(ts: i64, utc_offset_minutes: i32) -> u32 {
    let local = (ts + i64::from(utc_offset_minutes) * 60).rem_euclid(DAY_SECS);
    (local / HOUR_SECS) as u32
}

/// Truncate a UTC timestamp down to its hour boundary.
pub fn hour_floor(ts: i64) -> i64 {
    ts.div_euclid(HOUR_SECS) * HOUR_SECS
}

/// UTC timestamp range `[start, end)` covering one local day.
pub fn day_bounds(day_index: i64, utc_offset_minutes: i32) -> (i64, i64) {
    let start = day_index * DAY_SECS - i64::from(utc_offset_minutes) * 60;
    (start, start + DAY_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_index_at_utc() {
        assert_eq!(local_day_index(0, 0), 0);
        assert_eq!(local_day_index(DAY_SECS - 1, 0), 0);
        assert_eq!(local_day_index(DAY_SECS, 0), 1);
    }

    #[test]
    fn day_index_with_negative_offset() {
        // UTC-8: 2024-02-28T06:00Z is still Feb 27 locally.
        let ts = 1_709_100_000; // 2024-02-28T06:00:00Z
        let utc_day = local_day_index(ts, 0);
        assert_eq!(local_day_index(ts, -8 * 60), utc_day - 1);
    }

    #[test]
    fn local_hour_wraps() {
        // 01:00 UTC at UTC-8 is 17:00 the previous local day.
        assert_eq!(local_hour(HOUR_SECS, -8 * 60), 17);
        assert_eq!(local_hour(HOUR_SECS, 0), 1);
    }

    #[test]
    fn hour_floor_truncates() {
        assert_eq!(hour_floor(3_661), 3_600);
        assert_eq!(hour_floor(3_600), 3_600);
    }

    #[test]
    fn day_bounds_cover_exactly_one_day() {
        let (start, end) = day_bounds(19_781, -8 * 60);
        assert_eq!(end - start, DAY_SECS);
        assert_eq!(local_day_index(start, -8 * 60), 19_781);
        assert_eq!(local_day_index(end - 1, -8 * 60), 19_781);
        assert_eq!(local_day_index(end, -8 * 60), 19_782);
    }
}
