/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Milliseconds elapsed between `last_touched_ms` and `now_ms`, zero if the clock went backwards.
pub fn idle_for_ms(last_touched_ms: u64, now_ms: u64) -> u64 {
    now_ms.saturating_sub(last_touched_ms)
}

/// Returns true when the idle span strictly exceeds `threshold_ms`. A zero threshold never expires.
pub fn is_idle_beyond(last_touched_ms: u64, now_ms: u64, threshold_ms: u64) -> bool {
    threshold_ms > 0 && idle_for_ms(last_touched_ms, now_ms) > threshold_ms
}
