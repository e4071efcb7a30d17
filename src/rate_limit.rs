//! Rate limiting primitives.
//!
//! This module provides the building blocks for rate limiting:
//! - [`RateLimiter`]: The interface the middleware asks for a verdict.
//! - [`FixedWindowLimiter`]: Counts requests per client in fixed windows and blocks
//!   clients that exceed the limit.
//! - [`Decision`]: The result of a rate limit check (Allowed/Denied).
//!
//! # Architecture
//!
//! - **Middleware** (feature `http`): `RateLimitLayer` wraps your service. It doesn't know
//!   *how* limiting works, only that it should ask a `RateLimiter`.
//! - **Logic**: `FixedWindowLimiter` turns a store outcome into a `Decision` and logs it.
//! - **Storage**: `ClientStateStore` (in `store` module) owns the per-client state and runs
//!   the window/block state machine atomically per key.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

#[cfg(feature = "http")]
pub mod client_key;
pub mod fixed_window;
#[cfg(feature = "http")]
pub mod middleware;
pub mod store;

pub use fixed_window::FixedWindowLimiter;
#[cfg(feature = "http")]
pub use middleware::{RateLimitLayer, RateLimitService};
pub use store::{ClientState, ClientStateStore, InMemoryStore, ShardedStore, Verdict};

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request is allowed to proceed.
    Allowed {
        /// Requests counted in the current window, this one included.
        requests_made: u64,
        /// Configured requests per window.
        limit: u64,
    },
    /// The request is denied.
    Denied {
        /// Requests counted in the current window; the request that caused the block
        /// is included, requests rejected during the block are not.
        requests_made: u64,
        /// Configured requests per window.
        limit: u64,
        /// When the block ends.
        retry_after: DateTime<Utc>,
        /// Whole seconds until the block ends, never less than 1.
        /// Useful for `Retry-After` headers.
        retry_after_secs: u64,
        /// Human-readable reason.
        message: String,
    },
}

#[derive(Serialize)]
struct DenialBody<'a> {
    error: &'a str,
    limit: u64,
    requests_made: u64,
    retry_after: String,
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn requests_made(&self) -> u64 {
        match self {
            Decision::Allowed { requests_made, .. } | Decision::Denied { requests_made, .. } => {
                *requests_made
            }
        }
    }

    pub fn limit(&self) -> u64 {
        match self {
            Decision::Allowed { limit, .. } | Decision::Denied { limit, .. } => *limit,
        }
    }

    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        match self {
            Decision::Denied { retry_after, .. } => Some(*retry_after),
            Decision::Allowed { .. } => None,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Decision::Denied { retry_after_secs, .. } => Some(*retry_after_secs),
            Decision::Allowed { .. } => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Decision::Denied { message, .. } => Some(message.as_str()),
            Decision::Allowed { .. } => None,
        }
    }

    /// JSON body describing a denial; `None` for allowed decisions.
    ///
    /// ```
    /// use chrono::{TimeZone, Utc};
    /// use ratewarden::Decision;
    ///
    /// let denied = Decision::Denied {
    ///     requests_made: 120,
    ///     limit: 100,
    ///     retry_after: Utc.with_ymd_and_hms(2025, 2, 6, 14, 30, 0).unwrap(),
    ///     retry_after_secs: 42,
    ///     message: "Rate limit exceeded".into(),
    /// };
    /// assert_eq!(
    ///     denied.to_json().unwrap(),
    ///     r#"{"error":"Rate limit exceeded","limit":100,"requests_made":120,"retry_after":"2025-02-06T14:30:00Z"}"#
    /// );
    /// ```
    pub fn to_json(&self) -> Option<String> {
        match self {
            Decision::Denied { requests_made, limit, retry_after, message, .. } => {
                let body = DenialBody {
                    error: message,
                    limit: *limit,
                    requests_made: *requests_made,
                    retry_after: retry_after.to_rfc3339_opts(SecondsFormat::Secs, true),
                };
                serde_json::to_string(&body).ok()
            }
            Decision::Allowed { .. } => None,
        }
    }
}

/// Core interface for rate limiting logic.
///
/// This trait decouples the middleware from the limiting algorithm and its storage.
pub trait RateLimiter: Send + Sync {
    /// Error raised when no decision can be made (e.g. the state store is down).
    type Error: std::error::Error + Send + Sync + 'static;

    /// Count a request from `key` at the current time and decide whether it may proceed.
    fn check(&self, key: &str) -> Result<Decision, Self::Error>;
}
