//! Client identification for HTTP requests.

use http::{Extensions, HeaderMap};
use std::net::SocketAddr;
use std::sync::Arc;

/// Key used when a request carries no usable client address.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Raw peer address as reported by the server, e.g. `"203.0.113.9:52344"`.
///
/// Insert it into the request extensions when the server does not provide a bare
/// [`SocketAddr`] extension itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr(pub String);

/// Derives the client key for a request from its headers and extensions.
pub type ClientKeyFn = Arc<dyn Fn(&HeaderMap, &Extensions) -> String + Send + Sync>;

/// Default client key policy.
///
/// Uses the first non-empty entry of `X-Forwarded-For`, then `X-Real-IP`, then the peer
/// address from the request extensions with its port removed.
///
/// Only a bare [`SocketAddr`] or a [`RemoteAddr`] extension is read. Servers that wrap the
/// peer address in their own type (axum's `ConnectInfo<SocketAddr>`, for one) need either
/// a middleware that copies it into one of those two, or a custom key function via
/// [`RateLimitLayer::with_client_key`](crate::rate_limit::RateLimitLayer::with_client_key).
/// Otherwise every such request falls into the shared [`UNKNOWN_CLIENT`] bucket.
pub fn default_client_key(headers: &HeaderMap, extensions: &Extensions) -> String {
    if let Some(first) = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').map(str::trim).find(|hop| !hop.is_empty()))
    {
        return first.to_string();
    }
    if let Some(real_ip) = header_str(headers, "x-real-ip").filter(|v| !v.is_empty()) {
        return real_ip.to_string();
    }
    if let Some(addr) = extensions.get::<SocketAddr>() {
        return addr.ip().to_string();
    }
    if let Some(RemoteAddr(raw)) = extensions.get::<RemoteAddr>() {
        return strip_port(raw).to_string();
    }
    UNKNOWN_CLIENT.to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Drop a trailing `:port` from `host:port` or `[v6]:port`; anything else is returned as is.
fn strip_port(raw: &str) -> &str {
    if let Some(rest) = raw.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, _)) => host,
            None => raw,
        };
    }
    match raw.rsplit_once(':') {
        // More than one colon without brackets is a bare IPv6 address.
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => raw,
    }
}
