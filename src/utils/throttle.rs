//! Log throttling utility
//!
//! Limits how often the same log message is recorded. FFmpeg can print the
//! same error line many times per second while a camera is unreachable, and
//! a flapping camera fails its start repeatedly; both would flood the log.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct ThrottleEntry {
    last_logged: Instant,
    suppressed: u64,
}

/// Log throttler that limits how often the same message is logged
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use sentinel_live::utils::LogThrottler;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
///
/// // First call logs
/// assert!(throttler.should_log("cam1:stderr"));
///
/// // Subsequent calls within 5 seconds are suppressed
/// assert!(!throttler.should_log("cam1:stderr"));
/// ```
pub struct LogThrottler {
    entries: Mutex<HashMap<String, ThrottleEntry>>,
    interval: Duration,
}

impl LogThrottler {
    /// Create a new log throttler with the specified interval
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    /// Create a new log throttler with interval specified in seconds
    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Check if a message should be logged (not throttled)
    ///
    /// Returns `true` and restarts the interval when the key was not logged
    /// within the interval.
    pub fn should_log(&self, key: &str) -> bool {
        self.check(key).is_some()
    }

    /// Like [`should_log`](Self::should_log), but returns how many messages
    /// for this key were suppressed since it was last logged.
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                entry.last_logged = now;
                entry.suppressed = 0;
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    ThrottleEntry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Clear throttle state for a key (call when the condition recovers)
    pub fn clear(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Drop every key starting with `prefix` (e.g. all keys of one camera)
    pub fn clear_prefix(&self, prefix: &str) {
        self.entries.lock().retain(|k, _| !k.starts_with(prefix));
    }

    /// Get the number of tracked keys
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the throttler is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for LogThrottler {
    /// Create a default log throttler with 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Macro for throttled warning logging
///
/// # Example
///
/// ```rust
/// use sentinel_live::utils::LogThrottler;
/// use sentinel_live::warn_throttled;
///
/// let throttler = LogThrottler::default();
/// warn_throttled!(throttler, "my_error", "Error occurred: {}", "details");
/// ```
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::warn!(suppressed, $($arg)*);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_should_log_first_call() {
        let throttler = LogThrottler::with_secs(1);
        assert!(throttler.should_log("test_key"));
    }

    #[test]
    fn test_throttling_counts_suppressed() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert_eq!(throttler.check("test_key"), Some(0));
        assert_eq!(throttler.check("test_key"), None);
        assert_eq!(throttler.check("test_key"), None);

        thread::sleep(Duration::from_millis(150));

        assert_eq!(throttler.check("test_key"), Some(2));
    }

    #[test]
    fn test_different_keys() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("key1"));
        assert!(throttler.should_log("key2"));
        assert!(!throttler.should_log("key1"));
        assert!(!throttler.should_log("key2"));
    }

    #[test]
    fn test_clear_prefix() {
        let throttler = LogThrottler::with_secs(10);

        throttler.should_log("cam1:stderr");
        throttler.should_log("cam1:start");
        throttler.should_log("cam2:stderr");
        assert_eq!(throttler.len(), 3);

        throttler.clear_prefix("cam1:");
        assert_eq!(throttler.len(), 1);
        assert!(throttler.should_log("cam1:stderr"));
    }
}
