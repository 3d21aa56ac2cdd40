//! Utility functions for cellmap-core.

use time::OffsetDateTime;

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
