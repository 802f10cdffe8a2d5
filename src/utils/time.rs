//! Time utility functions

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Get current timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Whether `since` is at least `max_age` before `now`
pub fn older_than(since: Instant, now: Instant, max_age: Duration) -> bool {
    now.saturating_duration_since(since) >= max_age
}

/// Convert duration to milliseconds
pub fn duration_to_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_older_than() {
        let start = Instant::now();
        let later = start + Duration::from_secs(5);
        assert!(older_than(start, later, Duration::from_secs(5)));
        assert!(!older_than(start, later, Duration::from_secs(6)));
        assert!(!older_than(later, start, Duration::from_secs(1)));
    }

    #[test]
    fn test_duration_to_ms() {
        assert_eq!(duration_to_ms(Duration::from_secs(2)), 2000);
    }
}
