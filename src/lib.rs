#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # ratewarden
//!
//! Per-client request rate limiting: count each client's requests in a fixed window,
//! deny once the configured limit is exceeded, and keep the client blocked for a
//! configured period.
//!
//! ## Features
//!
//! - **Fixed-window counting** with a temporary block after the limit is exceeded
//! - **Atomic per-key decisions**: the whole state machine runs in one critical section
//! - **Pluggable state stores**: a single-lock map or a sharded map, or your own backend
//! - **Tower middleware** (feature `http`) answering `429 Too Many Requests`
//!
//! ## Quick Start
//!
//! ```rust
//! use ratewarden::{FixedWindowLimiter, RateLimitConfig};
//! use std::time::Duration;
//!
//! let limiter = FixedWindowLimiter::new(
//!     RateLimitConfig::default()
//!         .with_max_requests(3)
//!         .with_window(Duration::from_secs(60))
//!         .with_block(Duration::from_secs(30)),
//! );
//!
//! for _ in 0..3 {
//!     assert!(limiter.check_now("203.0.113.9").is_allowed());
//! }
//! let denied = limiter.check_now("203.0.113.9");
//! assert!(!denied.is_allowed());
//! assert_eq!(denied.requests_made(), 4);
//! assert!(denied.retry_after_secs().unwrap() >= 1);
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod rate_limit;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RateLimitConfig, WindowPolicy};
pub use error::{BoxError, LimiterError, MiddlewareError};
#[cfg(feature = "http")]
pub use rate_limit::client_key::{default_client_key, RemoteAddr};
pub use rate_limit::{
    ClientState, ClientStateStore, Decision, FixedWindowLimiter, InMemoryStore, RateLimiter,
    ShardedStore, Verdict,
};
#[cfg(feature = "http")]
pub use rate_limit::{RateLimitLayer, RateLimitService};
