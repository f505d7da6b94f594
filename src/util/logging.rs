//! # Logging Utilities
//!
//! Rate limiting for log messages that can repeat at bus speed (a device
//! sending undecodable payloads, an address that never answers reads) and a
//! hex dump helper for frame tracing.
//!
//! ```rust
//! use knx_bridge::util::logging::LogThrottle;
//! use std::time::Duration;
//!
//! let mut throttle = LogThrottle::new(Duration::from_secs(1), 5); // 5 messages per second
//! if throttle.allow() {
//!     log::warn!("undecodable payload");
//! }
//! ```

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Throttling structure for rate-limiting log messages.
#[derive(Debug)]
pub struct LogThrottle {
    window: Duration,
    /// Maximum messages allowed per window
    cap: u32,
    count: u32,
    /// Number of messages suppressed in the previous windows, not yet reported
    suppressed: u32,
    t0: Instant,
}

impl LogThrottle {
    /// Create new throttle with time window and message cap
    pub fn new(window: Duration, cap: u32) -> Self {
        Self {
            window,
            cap,
            count: 0,
            suppressed: 0,
            t0: Instant::now(),
        }
    }

    /// Check if logging is allowed (resets counter after window expires)
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.t0) > self.window {
            self.t0 = now;
            self.count = 0;
        }

        self.count = self.count.saturating_add(1);
        let allowed = self.count <= self.cap;
        if !allowed {
            self.suppressed = self.suppressed.saturating_add(1);
        }
        allowed
    }

    /// Returns and clears the number of messages dropped so far.
    pub fn take_suppressed(&mut self) -> u32 {
        std::mem::take(&mut self.suppressed)
    }

    /// Reset the throttle (start new window immediately)
    pub fn reset(&mut self) {
        self.t0 = Instant::now();
        self.count = 0;
    }
}

/// Independent throttles per category, shareable between tasks.
///
/// The bridge keys categories by group address so that one misbehaving
/// device cannot silence warnings about the others.
#[derive(Debug)]
pub struct ThrottleManager {
    window: Duration,
    cap: u32,
    throttles: Mutex<HashMap<String, LogThrottle>>,
}

impl ThrottleManager {
    pub fn new(window: Duration, cap: u32) -> Self {
        Self {
            window,
            cap,
            throttles: Mutex::new(HashMap::new()),
        }
    }

    /// Check if logging is allowed for a specific category.
    ///
    /// When a category is allowed again after dropping messages, the returned
    /// count tells how many were dropped.
    pub fn allow(&self, category: &str) -> Option<u32> {
        let mut throttles = self.throttles.lock().unwrap_or_else(|e| e.into_inner());
        let throttle = throttles
            .entry(category.to_string())
            .or_insert_with(|| LogThrottle::new(self.window, self.cap));
        throttle.allow().then(|| throttle.take_suppressed())
    }
}

impl Default for ThrottleManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), 5)
    }
}

/// Log frame data in hex format at trace level, cut to 64 bytes.
pub fn log_frame_hex(prefix: &str, data: &[u8]) {
    const MAX_LOG_BYTES: usize = 64;

    if !log::log_enabled!(log::Level::Trace) {
        return;
    }
    let shown = &data[..data.len().min(MAX_LOG_BYTES)];
    let suffix = if data.len() > MAX_LOG_BYTES {
        format!(" ... ({} bytes total)", data.len())
    } else {
        String::new()
    };
    log::trace!("{prefix}: {}{suffix}", hex::encode_upper(shown));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_throttle_basic() {
        let mut throttle = LogThrottle::new(Duration::from_secs(60), 3);

        assert!(throttle.allow());
        assert!(throttle.allow());
        assert!(throttle.allow());

        assert!(!throttle.allow());
        assert!(!throttle.allow());
        assert_eq!(throttle.take_suppressed(), 2);
        assert_eq!(throttle.take_suppressed(), 0);
    }

    #[test]
    fn test_log_throttle_reset() {
        let mut throttle = LogThrottle::new(Duration::from_secs(60), 2);

        assert!(throttle.allow());
        assert!(throttle.allow());
        assert!(!throttle.allow());

        throttle.reset();
        assert!(throttle.allow());
        assert!(throttle.allow());
        assert!(!throttle.allow());
    }

    #[test]
    fn test_log_throttle_window_expires() {
        let mut throttle = LogThrottle::new(Duration::from_millis(5), 1);
        assert!(throttle.allow());
        assert!(!throttle.allow());
        std::thread::sleep(Duration::from_millis(10));
        assert!(throttle.allow());
    }

    #[test]
    fn test_throttle_manager() {
        let manager = ThrottleManager::new(Duration::from_secs(60), 2);

        assert_eq!(manager.allow("1/1/1"), Some(0));
        assert_eq!(manager.allow("1/1/2"), Some(0));
        assert_eq!(manager.allow("1/1/1"), Some(0));
        assert_eq!(manager.allow("1/1/1"), None);
        assert_eq!(manager.allow("1/1/2"), Some(0));
    }
}
