//! Error types for the limiter and its middleware.
//!
//! A denied request is not an error: it comes back as [`Decision::Denied`](crate::Decision).
//! Errors here only report that no decision could be made at all.

use thiserror::Error;

/// Boxed error used where the concrete limiter error type is erased.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure to reach a decision.
#[derive(Debug, Error)]
pub enum LimiterError<E> {
    /// The client state store failed; the request was neither admitted nor denied.
    #[error("client state store failed: {0}")]
    Store(#[source] E),
}

impl<E> LimiterError<E> {
    /// Unwrap the store's own error.
    pub fn into_store_error(self) -> E {
        match self {
            Self::Store(e) => e,
        }
    }
}

#[cfg_attr(
    feature = "http",
    doc = "Error returned by [`RateLimitService`](crate::rate_limit::RateLimitService)."
)]
#[cfg_attr(not(feature = "http"), doc = "Error returned by the rate limiting middleware.")]
#[derive(Debug, Error)]
pub enum MiddlewareError<E> {
    /// The wrapped service failed.
    #[error("{0}")]
    Inner(#[source] E),
    /// The limiter could not decide; callers choose whether to fail open or closed.
    #[error("rate limiter unavailable: {0}")]
    Limiter(#[source] BoxError),
}

impl<E> MiddlewareError<E> {
    /// Check if this error came from the limiter rather than the wrapped service.
    pub fn is_limiter(&self) -> bool {
        matches!(self, Self::Limiter(_))
    }

    /// Get the inner service error if this is an Inner variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Limiter(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;
    use std::io;

    #[test]
    fn store_error_display_and_source() {
        let err = LimiterError::Store(io::Error::new(io::ErrorKind::Other, "backend down"));
        assert_eq!(err.to_string(), "client state store failed: backend down");
        assert!(err.source().is_some());
        assert_eq!(err.into_store_error().to_string(), "backend down");
    }

    #[test]
    fn middleware_error_variants() {
        let inner: MiddlewareError<io::Error> =
            MiddlewareError::Inner(io::Error::new(io::ErrorKind::Other, "handler"));
        assert!(!inner.is_limiter());
        assert_eq!(inner.to_string(), "handler");
        assert!(inner.into_inner().is_some());

        let limiter: MiddlewareError<io::Error> = MiddlewareError::Limiter("store gone".into());
        assert!(limiter.is_limiter());
        assert!(limiter.to_string().contains("store gone"));
        assert!(limiter.into_inner().is_none());
    }
}
