use chrono::{DateTime, Utc};

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;

/// Coarse relative age of `timestamp` as seen from `now`.
///
/// Timestamps in the future are reported as "just now".
pub fn time_ago(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - timestamp).num_seconds().max(0);

    if secs < MINUTE {
        "just now".to_string()
    } else if secs < HOUR {
        format!("{}m ago", secs / MINUTE)
    } else if secs < DAY {
        format!("{}h ago", secs / HOUR)
    } else if secs < WEEK {
        format!("{}d ago", secs / DAY)
    } else {
        format!("{}w ago", secs / WEEK)
    }
}

/// Label for a Unix epoch timestamp in (possibly fractional) seconds.
/// Values that do not map to a valid date yield an empty label.
pub fn time_ago_epoch(epoch_secs: f64, now: DateTime<Utc>) -> String {
    if !epoch_secs.is_finite() {
        return String::new();
    }

    DateTime::from_timestamp(epoch_secs.trunc() as i64, 0)
        .map(|ts| time_ago(ts, now))
        .unwrap_or_default()
}
