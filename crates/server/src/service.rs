use std::collections::BTreeSet;
use std::time::Duration;

use axum::middleware::from_fn_with_state;
use axum::routing::any;
use axum::Router;
use tracing::info;

use turnstile_common::{RateLimitSettings, TurnstileResult};
use turnstile_rate_limit::{throttle, RateLimitConfig, RateLimiter};

use crate::upstream::{forward, Upstream};

/// The two limiters in front of the application.
#[derive(Clone)]
pub struct Limiters {
    /// Guards every route.
    pub general: RateLimiter,
    /// Guards authentication routes, behind `general`.
    pub auth: RateLimiter,
}

impl Limiters {
    pub fn from_settings(settings: &RateLimitSettings) -> TurnstileResult<Self> {
        let general = RateLimiter::named("general", RateLimitConfig::general(settings)?);
        let auth = RateLimiter::named("auth", RateLimitConfig::auth(settings)?);

        if settings.trusted_proxies.is_empty() {
            info!(
                general = settings.general_rpw,
                auth = settings.auth_rpw,
                window_secs = settings.window_secs,
                "rate limiting configured (no trusted proxies, keying on peer address only)"
            );
        } else {
            info!(
                general = settings.general_rpw,
                auth = settings.auth_rpw,
                window_secs = settings.window_secs,
                trusted_proxies = ?settings.trusted_proxies,
                "rate limiting configured"
            );
        }

        Ok(Self { general, auth })
    }

    pub fn all(&self) -> Vec<RateLimiter> {
        vec![self.general.clone(), self.auth.clone()]
    }

    pub fn start_sweepers(&self, period: Duration) -> TurnstileResult<()> {
        for limiter in [&self.general, &self.auth] {
            limiter.start_sweeper(period)?;
        }
        Ok(())
    }

    /// Stop both sweepers, returning the first failure after trying both.
    pub async fn stop_sweepers(&self) -> TurnstileResult<()> {
        let general = self.general.stop_sweeper().await;
        let auth = self.auth.stop_sweeper().await;
        general.and(auth)
    }
}

/// Build the throttled front.
///
/// Every request passes the `general` limiter; requests under one of
/// `auth_paths` then also pass the `auth` limiter. Admitted requests are
/// relayed to `upstream`.
pub fn build_router(upstream: Upstream, limiters: &Limiters, auth_paths: &[String]) -> Router {
    let prefixes: BTreeSet<&str> = auth_paths.iter().map(String::as_str).collect();

    let mut auth_routes: Router<Upstream> = Router::new();
    for prefix in &prefixes {
        auth_routes = auth_routes
            .route(prefix, any(forward))
            .route(&format!("{}/{{*rest}}", prefix), any(forward));
    }
    // route_layer panics on a router without routes.
    if !prefixes.is_empty() {
        auth_routes = auth_routes.route_layer(from_fn_with_state(limiters.auth.clone(), throttle));
    }

    Router::new()
        .merge(auth_routes)
        .fallback(forward)
        .layer(from_fn_with_state(limiters.general.clone(), throttle))
        .with_state(upstream)
}
