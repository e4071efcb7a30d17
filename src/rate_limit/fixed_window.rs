use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitConfig;
use crate::error::LimiterError;
use crate::rate_limit::store::{ClientState, ClientStateStore, InMemoryStore, Verdict};
use crate::rate_limit::{Decision, RateLimiter};
use chrono::{DateTime, Utc};
use std::sync::Arc;

const LOG_TARGET: &str = "ratewarden::limiter";

/// A fixed-window limiter with temporary blocks.
///
/// Each client may make `max_requests` requests per window. The request after that is
/// denied and the client is blocked for the configured block duration; requests during
/// the block are denied without being counted. When either the block or the window
/// runs out, counting restarts at 1 with the current request.
///
/// Clones share the same store and clock.
///
/// ```
/// use ratewarden::{FixedWindowLimiter, RateLimitConfig};
///
/// let limiter = FixedWindowLimiter::new(RateLimitConfig::default().with_max_requests(2));
/// assert!(limiter.check_now("10.0.0.1").is_allowed());
/// assert!(limiter.check_now("10.0.0.1").is_allowed());
/// assert!(!limiter.check_now("10.0.0.1").is_allowed());
/// ```
#[derive(Debug)]
pub struct FixedWindowLimiter<S = InMemoryStore> {
    store: Arc<S>,
    config: Arc<RateLimitConfig>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for FixedWindowLimiter<S> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), config: self.config.clone(), clock: self.clock.clone() }
    }
}

impl FixedWindowLimiter<InMemoryStore> {
    /// Create a limiter backed by a fresh [`InMemoryStore`].
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_store(config, InMemoryStore::new())
    }

    /// Like [`check`](Self::check); the in-memory store cannot fail.
    pub fn check_now(&self, key: &str) -> Decision {
        match self.check(key) {
            Ok(decision) => decision,
            Err(LimiterError::Store(never)) => match never {},
        }
    }
}

impl<S> FixedWindowLimiter<S>
where
    S: ClientStateStore,
{
    /// Create a limiter over an explicit store.
    pub fn with_store(config: RateLimitConfig, store: S) -> Self {
        tracing::debug!(
            target: LOG_TARGET,
            max_requests = config.max_requests(),
            window = ?config.window(),
            block = ?config.block(),
            "creating fixed window rate limiter"
        );
        Self { store: Arc::new(store), config: Arc::new(config), clock: Arc::new(SystemClock) }
    }

    /// Override the clock used by [`check`](Self::check) (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// The backing store, for inspection and administrative operations.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Decide on a request from `key` at `now`.
    ///
    /// Store faults come back as `Err`; they are never folded into allow or deny.
    pub fn decide(&self, key: &str, now: DateTime<Utc>) -> Result<Decision, LimiterError<S::Error>> {
        let policy = self.config.window_policy();
        let (state, verdict) =
            self.store.check_and_increment(key, now, &policy).map_err(LimiterError::Store)?;

        let limit = self.config.max_requests();
        let decision = match verdict {
            Verdict::Admitted => Decision::Allowed { requests_made: state.request_count, limit },
            Verdict::Tripped | Verdict::Blocked => self.denial(&state, now),
        };
        self.log(key, verdict, &decision);
        Ok(decision)
    }

    /// Decide on a request from `key` using the limiter's clock.
    pub fn check(&self, key: &str) -> Result<Decision, LimiterError<S::Error>> {
        self.decide(key, self.clock.now())
    }

    /// Forget a single client's state.
    pub fn reset(&self, key: &str) -> Result<(), LimiterError<S::Error>> {
        self.store.delete(key).map_err(LimiterError::Store)
    }

    /// Forget every client's state.
    pub fn reset_all(&self) -> Result<(), LimiterError<S::Error>> {
        self.store.clear().map_err(LimiterError::Store)
    }

    fn denial(&self, state: &ClientState, now: DateTime<Utc>) -> Decision {
        // A denial always carries a block; fall back to `now` if a custom store forgot it.
        let retry_after = state.blocked_until.unwrap_or(now);
        let remaining = retry_after.signed_duration_since(now).num_seconds();
        Decision::Denied {
            requests_made: state.request_count,
            limit: self.config.max_requests(),
            retry_after,
            retry_after_secs: u64::try_from(remaining).unwrap_or(0).max(1),
            message: self.config.message().to_string(),
        }
    }

    fn log(&self, key: &str, verdict: Verdict, decision: &Decision) {
        let limit = decision.limit();
        let requests_made = decision.requests_made();
        match (verdict, decision.retry_after()) {
            (Verdict::Tripped, Some(retry_after)) => tracing::info!(
                target: LOG_TARGET,
                client_id = %key,
                requests_made,
                limit,
                retry_after = %retry_after,
                "rate limit exceeded"
            ),
            (Verdict::Blocked, Some(retry_after)) => tracing::info!(
                target: LOG_TARGET,
                client_id = %key,
                requests_made,
                limit,
                retry_after = %retry_after,
                "client blocked"
            ),
            _ if !self.config.log_on_exceed_only() => tracing::debug!(
                target: LOG_TARGET,
                client_id = %key,
                requests_made,
                limit,
                "request allowed"
            ),
            _ => {}
        }
    }
}

impl<S> RateLimiter for FixedWindowLimiter<S>
where
    S: ClientStateStore,
{
    type Error = LimiterError<S::Error>;

    fn check(&self, key: &str) -> Result<Decision, Self::Error> {
        self.decide(key, self.clock.now())
    }
}
