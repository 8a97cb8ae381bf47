pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use turnstile_common::AppConfig;
use turnstile_rate_limit::RateLimiter;

pub use state::{AppState, SharedState, ThrottleMetrics};

/// Build the Axum router with all admin API routes.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/health", get(routes::health::health_check))
        .route("/api/metrics", get(routes::metrics::get_metrics))
        .route("/api/config", get(routes::config::get_config))
        .route("/api/stats", get(routes::stats::get_stats))
        .with_state(state)
}

/// Serve the admin API on `listen_addr` until `shutdown` is cancelled.
pub async fn run_admin_server(
    state: SharedState,
    listen_addr: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = %listen_addr, "admin API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("admin API server stopped");
    Ok(())
}

/// Convenience function to create a SharedState from a config and the
/// limiters it produced.
pub fn new_shared_state(config: AppConfig, limiters: Vec<RateLimiter>) -> anyhow::Result<SharedState> {
    Ok(Arc::new(AppState::new(config, limiters)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;
    use turnstile_rate_limit::{RateLimitConfig, TrustedProxies};

    fn state() -> (SharedState, RateLimiter) {
        let config = RateLimitConfig::new(2, Duration::from_secs(60), TrustedProxies::default())
            .unwrap();
        let limiter = RateLimiter::named("auth", config);
        let state = new_shared_state(AppConfig::default(), vec![limiter.clone()]).unwrap();
        (state, limiter)
    }

    async fn get_body(router: Router, uri: &str) -> (StatusCode, String) {
        let resp = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let (state, _) = state();
        let (status, body) = get_body(build_router(state), "/api/health").await;

        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn stats_reflect_limiter_decisions() {
        let (state, limiter) = state();
        for _ in 0..3 {
            limiter.check("10.0.0.1");
        }

        let (status, body) = get_body(build_router(state), "/api/stats").await;
        assert_eq!(status, StatusCode::OK);

        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["admitted_requests"], 2);
        assert_eq!(json["throttled_requests"], 1);
        assert!(json["uptime_secs"].is_u64());

        let limiters = json["limiters"].as_array().unwrap();
        assert_eq!(limiters.len(), 1);
        assert_eq!(limiters[0]["name"], "auth");
        assert_eq!(limiters[0]["tracked_clients"], 1);
        assert_eq!(limiters[0]["admitted"], 2);
        assert_eq!(limiters[0]["throttled"], 1);
    }

    #[tokio::test]
    async fn metrics_are_synced_without_double_counting() {
        let (state, limiter) = state();
        limiter.check("10.0.0.1");

        let router = build_router(state);
        get_body(router.clone(), "/api/metrics").await;
        let (status, body) = get_body(router, "/api/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("turnstile_requests_admitted_total{limiter=\"auth\"} 1"));
        assert!(body.contains("turnstile_tracked_clients{limiter=\"auth\"} 1"));
    }

    #[tokio::test]
    async fn config_is_served_as_json() {
        let (state, _) = state();
        let (status, body) = get_body(build_router(state), "/api/config").await;

        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["rate_limit"]["auth_rpw"], 5);
    }
}
