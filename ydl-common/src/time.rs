//! Timestamp utilities

use chrono::{DateTime, Duration, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Timestamp `seconds` before now
pub fn seconds_ago(seconds: u64) -> DateTime<Utc> {
    Utc::now() - Duration::seconds(seconds as i64)
}
