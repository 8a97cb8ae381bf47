use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{
    CONNECTION, CONTENT_LENGTH, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, warn};

use turnstile_common::{TurnstileError, TurnstileResult};
use turnstile_rate_limit::ClientKey;

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// The protected application that admitted requests are relayed to.
#[derive(Clone)]
pub struct Upstream {
    client: reqwest::Client,
    base_url: String,
    body_limit: usize,
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("request body unreadable or larger than {0} bytes")]
    Body(usize),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        let status = match self {
            ForwardError::Body(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ForwardError::Upstream(_) => StatusCode::BAD_GATEWAY,
        };
        (status, format!("{}\n", status.canonical_reason().unwrap_or("error"))).into_response()
    }
}

impl Upstream {
    pub fn new(base_url: &str, body_limit: usize) -> TurnstileResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| TurnstileError::Upstream(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            body_limit,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn target_url(&self, uri: &Uri) -> String {
        let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
        format!("{}{}", self.base_url, path_and_query)
    }

    /// Relay `req` to the upstream and its response back.
    pub async fn relay(&self, req: Request) -> Result<Response, ForwardError> {
        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, self.body_limit)
            .await
            .map_err(|_| ForwardError::Body(self.body_limit))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);
        set_client_identity(&mut headers, parts.extensions.get::<ClientKey>());

        let url = self.target_url(&parts.uri);
        debug!(method = %parts.method, url = %url, "forwarding request");

        let upstream_resp = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = upstream_resp.status();
        let mut resp_headers = upstream_resp.headers().clone();
        strip_hop_by_hop(&mut resp_headers);
        resp_headers.remove(CONTENT_LENGTH);
        let bytes = upstream_resp.bytes().await?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = resp_headers;
        Ok(response)
    }
}

/// Downstream handler behind the rate limiters.
pub async fn forward(State(upstream): State<Upstream>, req: Request) -> Response {
    match upstream.relay(req).await {
        Ok(response) => response,
        Err(e) => {
            warn!(upstream = %upstream.base_url, error = %e, "forwarding failed");
            e.into_response()
        }
    }
}

/// Replace client-supplied forwarding headers with the resolved client key,
/// so the upstream only sees identities the limiter accepted.
fn set_client_identity(headers: &mut HeaderMap, key: Option<&ClientKey>) {
    headers.remove(X_FORWARDED_FOR);
    headers.remove(X_REAL_IP);
    if let Some(value) = key.and_then(|k| HeaderValue::from_str(k.as_str()).ok()) {
        headers.insert(X_FORWARDED_FOR, value.clone());
        headers.insert(X_REAL_IP, value);
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in [
        CONNECTION,
        KEEP_ALIVE,
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
    ] {
        headers.remove(name);
    }
}
