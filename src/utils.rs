use chrono::{DateTime, Duration, Utc};

pub fn format_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

/// Whole seconds left of `period` started at `since`, zero once elapsed
pub fn remaining_seconds(since: DateTime<Utc>, period: Duration, now: DateTime<Utc>) -> u64 {
    let left = (since + period) - now;
    if left <= Duration::zero() {
        0
    } else {
        // round partial seconds up so "0" really means "ready"
        ((left.num_milliseconds() + 999) / 1000) as u64
    }
}
