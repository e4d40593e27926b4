//! Time utilities.
//!
//! The engine's `tick(now)` methods take an explicit `now` rather than
//! reading the clock themselves, so tests can drive time deterministically.
//! This module is only for the engine's own wall-clock calls: mapping a
//! reading of the real clock onto that explicit `now`.

/// Returns the current Unix timestamp in seconds.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_timestamp_is_reasonable() {
        let ts = now_timestamp();
        assert!(ts > 1704067200, "timestamp {} is too old", ts);
        assert!(ts < 4102444800, "timestamp {} is too far in future", ts);
    }

    #[test]
    fn test_now_timestamp_millis_is_reasonable() {
        let ts = now_timestamp_millis();
        assert!(ts > 1_704_067_200_000, "timestamp {} is too old", ts);
    }
}
