//! Timestamp utilities
//!
//! All timestamps in Earshot are UTC. SQLite stores them as integer Unix
//! seconds so the `(friend_id, started_at)` idempotency key compares exactly,
//! with no text-format ambiguity.

use chrono::{DateTime, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Whole hours elapsed since the Unix epoch for a timestamp.
///
/// Aggregate buckets are keyed by this value; [`hour_of_day`] folds it into
/// the 24-slot heatmap axis.
pub fn epoch_hour(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(3600)
}

/// Hour of day (0-23, UTC) for an epoch hour
pub fn hour_of_day(epoch_hour: i64) -> usize {
    epoch_hour.rem_euclid(24) as usize
}

/// Convert Unix seconds (as stored in SQLite) to a UTC timestamp.
///
/// Out-of-range values collapse to the epoch instead of panicking on a
/// malformed row.
pub fn from_unix_seconds(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Convert Unix milliseconds (the presence feed's timestamp unit) to a UTC
/// timestamp. Sub-second precision is kept.
pub fn from_unix_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH)
}
