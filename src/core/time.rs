use std::time::{SystemTime, UNIX_EPOCH};

/// Sentinel for publishes without a message expiry interval.
pub const MESSAGE_EXPIRY_NOT_SET: u64 = u64::MAX;

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn unix_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Whether a message created at `timestamp_millis` with the given expiry
/// interval (seconds) has expired at `now_millis`.
pub fn is_expired_at(timestamp_millis: u64, expiry_interval_secs: u64, now_millis: u64) -> bool {
    if expiry_interval_secs == MESSAGE_EXPIRY_NOT_SET {
        return false;
    }
    let expiry_millis = expiry_interval_secs.saturating_mul(1000);
    timestamp_millis.saturating_add(expiry_millis) <= now_millis
}
