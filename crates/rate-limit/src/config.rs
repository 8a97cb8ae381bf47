use std::time::Duration;

use turnstile_common::{RateLimitSettings, TurnstileError, TurnstileResult, MAX_WINDOW_SECS};

use crate::client_key::TrustedProxies;

/// Immutable configuration of one limiter instance.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    capacity: u64,
    window: Duration,
    trusted_proxies: TrustedProxies,
}

impl RateLimitConfig {
    /// Build a config, rejecting a zero capacity and a window that is zero
    /// or longer than [`MAX_WINDOW_SECS`].
    pub fn new(
        capacity: u64,
        window: Duration,
        trusted_proxies: TrustedProxies,
    ) -> TurnstileResult<Self> {
        if capacity == 0 {
            return Err(TurnstileError::Config(
                "rate limit capacity must be greater than zero".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(TurnstileError::Config(
                "rate limit window must be greater than zero".to_string(),
            ));
        }
        if window > Duration::from_secs(MAX_WINDOW_SECS) {
            return Err(TurnstileError::Config(format!(
                "rate limit window must be at most {}s, got {}s",
                MAX_WINDOW_SECS,
                window.as_secs()
            )));
        }
        Ok(Self {
            capacity,
            window,
            trusted_proxies,
        })
    }

    /// Config for the limiter guarding every route.
    pub fn general(settings: &RateLimitSettings) -> TurnstileResult<Self> {
        Self::from_settings(settings, settings.general_rpw)
    }

    /// Config for the stricter limiter guarding authentication routes.
    pub fn auth(settings: &RateLimitSettings) -> TurnstileResult<Self> {
        Self::from_settings(settings, settings.auth_rpw)
    }

    fn from_settings(settings: &RateLimitSettings, capacity: u64) -> TurnstileResult<Self> {
        Self::new(
            capacity,
            Duration::from_secs(settings.window_secs),
            TrustedProxies::new(settings.trusted_proxies.iter().cloned()),
        )
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn trusted_proxies(&self) -> &TrustedProxies {
        &self.trusted_proxies
    }
}
