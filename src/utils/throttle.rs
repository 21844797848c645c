//! Log throttling
//!
//! Limits how often the same warning is written, so a streamer that keeps
//! sending unusable candidates or a stats source that keeps failing does
//! not flood the log.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Remembers when each message key was last logged
///
/// ```rust
/// use pixelstream::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("dropped_candidate"));
/// assert!(!throttler.should_log("dropped_candidate"));
/// ```
pub struct LogThrottler {
    last_logged: Mutex<HashMap<String, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` (and records the time) when `key` may be logged now
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut map = self.last_logged.lock();
        match map.get(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                map.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Forget `key`, so its next occurrence is logged immediately
    pub fn clear(&self, key: &str) {
        self.last_logged.lock().remove(key);
    }

    pub fn clear_all(&self) {
        self.last_logged.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.last_logged.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_logged.lock().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

/// Throttled `tracing::debug!`
#[macro_export]
macro_rules! debug_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::debug!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_different_keys() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("key1"));
        assert!(throttler.should_log("key2"));
        assert!(!throttler.should_log("key1"));
        assert!(!throttler.should_log("key2"));
        assert_eq!(throttler.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_expires() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert!(throttler.should_log("stats"));
        assert!(!throttler.should_log("stats"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(throttler.should_log("stats"));
    }

    #[test]
    fn test_clear() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("a"));
        assert!(throttler.should_log("b"));
        throttler.clear("a");
        assert!(throttler.should_log("a"));
        assert!(!throttler.should_log("b"));

        throttler.clear_all();
        assert!(throttler.is_empty());
    }
}
