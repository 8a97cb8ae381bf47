//! axum middleware applying a [`RateLimiter`] to every request.
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/", get(handler))
//!     .layer(axum::middleware::from_fn_with_state(limiter, throttle));
//! ```
//!
//! The peer address comes from `ConnectInfo<SocketAddr>`, so the server
//! must be started with `into_make_service_with_connect_info::<SocketAddr>()`.

use std::net::SocketAddr;
use std::sync::Once;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderName, CONTENT_TYPE, RETRY_AFTER, X_CONTENT_TYPE_OPTIONS};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::fixed_window::Decision;
use crate::RateLimiter;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Key used for every request when the peer address is unavailable.
pub const UNKNOWN_PEER: &str = "unknown";

static MISSING_CONNECT_INFO: Once = Once::new();

/// Admit or reject a request against `limiter`.
///
/// Admitted requests reach `next`; the resolved [`ClientKey`](crate::ClientKey)
/// is inserted into the request extensions first. Rejected requests get a
/// 429 and `next` is never called.
///
/// Rate-limit headers are only filled in on the way out when absent, so in
/// a chain of limiters the innermost one that ran decides what the client
/// sees.
pub async fn throttle(State(limiter): State<RateLimiter>, mut req: Request, next: Next) -> Response {
    let peer = match req.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => addr.to_string(),
        None => {
            MISSING_CONNECT_INFO.call_once(|| {
                warn!(
                    "ConnectInfo not available; all requests share the '{}' rate limit key",
                    UNKNOWN_PEER
                );
            });
            UNKNOWN_PEER.to_string()
        }
    };

    let key = limiter.client_key(&peer, req.headers());
    let decision = limiter.check(key.as_str());

    if !decision.allowed {
        let retry_after = decision.retry_after_secs();
        debug!(
            limiter = limiter.name(),
            client_key = %key,
            retry_after_secs = retry_after,
            "request rate limited"
        );
        return too_many_requests(&decision);
    }

    req.extensions_mut().insert(key);
    let mut response = next.run(req).await;
    fill_missing_headers(response.headers_mut(), &decision);
    response
}

fn too_many_requests(decision: &Decision) -> Response {
    let retry_after = decision.retry_after_secs();
    let body = format!(
        "Rate limit exceeded. Try again in {} seconds.\n",
        retry_after
    );

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Body::from(body)).into_response();
    let headers = response.headers_mut();
    set_rate_limit_headers(headers, decision);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

fn set_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(decision.reset_unix_secs()),
    );
}

fn fill_missing_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers
        .entry(X_RATELIMIT_LIMIT)
        .or_insert_with(|| HeaderValue::from(decision.limit));
    headers
        .entry(X_RATELIMIT_REMAINING)
        .or_insert_with(|| HeaderValue::from(decision.remaining));
    headers
        .entry(X_RATELIMIT_RESET)
        .or_insert_with(|| HeaderValue::from(decision.reset_unix_secs()));
}
