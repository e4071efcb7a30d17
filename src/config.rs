//! Limiter configuration.

use std::time::Duration;

/// Default number of requests admitted per window.
pub const DEFAULT_MAX_REQUESTS: u64 = 100;
/// Default length of a counting window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
/// Default length of the block imposed after the limit is exceeded.
pub const DEFAULT_BLOCK: Duration = Duration::from_secs(60);
/// Default message attached to denied decisions.
pub const DEFAULT_MESSAGE: &str = "Rate limit exceeded";

/// Numeric parameters of the fixed-window state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    /// How long a counting window lasts.
    pub window: Duration,
    /// Requests admitted per window; the next one trips the block.
    pub max_requests: u64,
    /// How long a client stays blocked once tripped.
    pub block: Duration,
}

/// Configuration for [`FixedWindowLimiter`](crate::FixedWindowLimiter).
///
/// Values are not validated: a zero limit denies every request and a zero block
/// denies only the tripping request.
///
/// ```
/// use ratewarden::RateLimitConfig;
/// use std::time::Duration;
///
/// let config = RateLimitConfig::default()
///     .with_max_requests(10)
///     .with_window(Duration::from_secs(1))
///     .with_block(Duration::from_secs(30));
/// assert_eq!(config.max_requests(), 10);
/// assert_eq!(config.message(), "Rate limit exceeded");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    max_requests: u64,
    window: Duration,
    block: Duration,
    message: String,
    log_on_exceed_only: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: DEFAULT_WINDOW,
            block: DEFAULT_BLOCK,
            message: DEFAULT_MESSAGE.to_string(),
            log_on_exceed_only: true,
        }
    }
}

impl RateLimitConfig {
    /// Set the number of requests admitted per window.
    pub fn with_max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Set the counting window length.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set how long an over-limit client stays blocked.
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    /// Set the message carried by denied decisions.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// When `false`, allowed decisions are logged at debug level as well as denials.
    pub fn with_log_on_exceed_only(mut self, enabled: bool) -> Self {
        self.log_on_exceed_only = enabled;
        self
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn block(&self) -> Duration {
        self.block
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn log_on_exceed_only(&self) -> bool {
        self.log_on_exceed_only
    }

    /// The numeric subset handed to the store's compound operation.
    pub fn window_policy(&self) -> WindowPolicy {
        WindowPolicy { window: self.window, max_requests: self.max_requests, block: self.block }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RateLimitConfig::default();
        assert_eq!(config.max_requests(), 100);
        assert_eq!(config.window(), Duration::from_secs(60));
        assert_eq!(config.block(), Duration::from_secs(60));
        assert_eq!(config.message(), "Rate limit exceeded");
        assert!(config.log_on_exceed_only());
    }

    #[test]
    fn builder_overrides_each_field() {
        let config = RateLimitConfig::default()
            .with_max_requests(0)
            .with_window(Duration::ZERO)
            .with_block(Duration::from_millis(250))
            .with_message("slow down")
            .with_log_on_exceed_only(false);

        assert_eq!(
            config.window_policy(),
            WindowPolicy {
                window: Duration::ZERO,
                max_requests: 0,
                block: Duration::from_millis(250),
            }
        );
        assert_eq!(config.message(), "slow down");
        assert!(!config.log_on_exceed_only());
    }
}
