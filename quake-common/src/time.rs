//! Timestamp utilities

use chrono::{DateTime, TimeZone, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert epoch milliseconds to a UTC timestamp
///
/// Returns `None` for values outside chrono's representable range.
pub fn from_epoch_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Truncate a timestamp to millisecond precision
///
/// Normalized origin times carry millisecond precision; sub-millisecond
/// digits from high-resolution catalogs are dropped so that re-parsing is
/// byte-identical.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_epoch_millis(ts.timestamp_millis()).unwrap_or(ts)
}
