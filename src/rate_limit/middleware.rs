use crate::error::MiddlewareError;
use crate::rate_limit::client_key::{default_client_key, ClientKeyFn};
use crate::rate_limit::{Decision, RateLimiter};
use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{Extensions, HeaderMap, HeaderValue, Request, Response, StatusCode};
use pin_project::pin_project;
use std::fmt;
use std::future::{Future, Ready};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that enforces rate limits using a [`RateLimiter`].
///
/// Denied requests get `429 Too Many Requests` with a `Retry-After` header and, unless
/// disabled, a JSON body built by [`Decision::to_json`].
pub struct RateLimitLayer<L> {
    limiter: Arc<L>,
    client_key: ClientKeyFn,
    json_body: bool,
}

impl<L> RateLimitLayer<L> {
    /// Create a new rate limit layer using the default client key policy.
    pub fn new(limiter: L) -> Self {
        Self::from_shared(Arc::new(limiter))
    }

    /// Create a layer over a limiter that is also used elsewhere (e.g. for admin resets).
    pub fn from_shared(limiter: Arc<L>) -> Self {
        Self { limiter, client_key: Arc::new(default_client_key), json_body: true }
    }

    /// Replace the function that derives a client key from a request.
    pub fn with_client_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&HeaderMap, &Extensions) -> String + Send + Sync + 'static,
    {
        self.client_key = Arc::new(f);
        self
    }

    /// Toggle the JSON body on 429 responses (default: on).
    pub fn with_json_body(mut self, enabled: bool) -> Self {
        self.json_body = enabled;
        self
    }
}

impl<L> Clone for RateLimitLayer<L> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            client_key: self.client_key.clone(),
            json_body: self.json_body,
        }
    }
}

impl<L> fmt::Debug for RateLimitLayer<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer").field("json_body", &self.json_body).finish_non_exhaustive()
    }
}

impl<S, L> Layer<S> for RateLimitLayer<L> {
    type Service = RateLimitService<S, L>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            client_key: self.client_key.clone(),
            json_body: self.json_body,
        }
    }
}

/// Middleware service that enforces rate limits.
pub struct RateLimitService<S, L> {
    inner: S,
    limiter: Arc<L>,
    client_key: ClientKeyFn,
    json_body: bool,
}

impl<S: Clone, L> Clone for RateLimitService<S, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            client_key: self.client_key.clone(),
            json_body: self.json_body,
        }
    }
}

impl<S: fmt::Debug, L> fmt::Debug for RateLimitService<S, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitService")
            .field("inner", &self.inner)
            .field("json_body", &self.json_body)
            .finish_non_exhaustive()
    }
}

impl<S, L> RateLimitService<S, L> {
    fn too_many_requests<B: From<String>>(&self, decision: &Decision) -> Response<B> {
        let body = if self.json_body { decision.to_json() } else { None };
        let has_body = body.is_some();
        let mut response = Response::new(B::from(body.unwrap_or_default()));
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;

        let headers = response.headers_mut();
        headers.insert(RETRY_AFTER, HeaderValue::from(decision.retry_after_secs().unwrap_or(1)));
        if has_body {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        response
    }
}

impl<S, L, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S, L>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    L: RateLimiter,
    ResBody: From<String>,
{
    type Response = Response<ResBody>;
    type Error = MiddlewareError<S::Error>;
    type Future = ResponseFuture<S::Future, ResBody, S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(MiddlewareError::Inner)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let key = (self.client_key)(req.headers(), req.extensions());

        match self.limiter.check(&key) {
            Ok(decision) if decision.is_allowed() => {
                ResponseFuture::Inner { future: self.inner.call(req) }
            }
            Ok(decision) => ResponseFuture::Ready {
                future: std::future::ready(Ok(self.too_many_requests(&decision))),
            },
            Err(err) => {
                tracing::warn!(
                    target: "ratewarden::middleware",
                    client_id = %key,
                    error = %err,
                    "rate limiter failed; request not forwarded"
                );
                ResponseFuture::Ready {
                    future: std::future::ready(Err(MiddlewareError::Limiter(Box::new(err)))),
                }
            }
        }
    }
}

type Finished<B, E> = Result<Response<B>, MiddlewareError<E>>;

/// Response future for [`RateLimitService`].
#[pin_project(project = ResponseFutureProj)]
pub enum ResponseFuture<F, B, E> {
    /// The request was allowed and is being handled by the inner service.
    Inner {
        #[pin]
        future: F,
    },
    /// The request was answered by the limiter itself.
    Ready {
        #[pin]
        future: Ready<Finished<B, E>>,
    },
}

impl<F, B, E> Future for ResponseFuture<F, B, E>
where
    F: Future<Output = Result<Response<B>, E>>,
{
    type Output = Finished<B, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            ResponseFutureProj::Inner { future } => future.poll(cx).map_err(MiddlewareError::Inner),
            ResponseFutureProj::Ready { future } => future.poll(cx),
        }
    }
}
